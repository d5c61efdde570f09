//! Typed wrappers around wire-format DNS messages.
//!
//! A [`Query`] is a message with exactly one question; a [`Response`] is the
//! answer to such a message. Anything else (multiple questions, dynamic
//! updates, ...) is not representable here on purpose: callers that need to
//! relay such traffic do so on the raw bytes without going through this crate.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::IpAddr;

use domain::{
    base::{
        Message, MessageBuilder, ParsedName, Question, RecordSection,
        message_builder::AnswerBuilder, name::FlattenInto as _,
    },
    dep::octseq::OctetsInto as _,
    rdata::AllRecordData,
};

pub type RecordType = domain::base::iana::Rtype;
pub type QueryClass = domain::base::iana::Class;
pub type ResponseCode = domain::base::iana::Rcode;
pub type Ttl = domain::base::Ttl;

pub type DomainName = domain::base::Name<Vec<u8>>;
pub type Record<'a> =
    domain::base::Record<ParsedName<&'a [u8]>, AllRecordData<&'a [u8], ParsedName<&'a [u8]>>>;
pub type RecordData<'a> = AllRecordData<&'a [u8], ParsedName<&'a [u8]>>;

pub type OwnedRecord = domain::base::Record<DomainName, AllRecordData<Vec<u8>, DomainName>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;

#[derive(Clone)]
pub struct Query {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.inner.header().id())
            .field("type", &self.qtype())
            .field("domain", &self.domain())
            .finish()
    }
}

impl Query {
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if message.header().qr() {
            return Err(Error::NotAQuery);
        }

        let num_questions = message.header_counts().qdcount();
        if num_questions != 1 {
            // Callers forward these verbatim instead of classifying them.
            return Err(Error::QuestionCount(num_questions));
        }

        let _ = message.sole_question()?;

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn new(domain: DomainName, rtype: RecordType) -> Self {
        let mut inner = MessageBuilder::new_vec().question();
        inner.header_mut().set_qr(false);
        inner.header_mut().set_rd(true); // Default to recursion desired.
        inner.header_mut().set_random_id();

        inner
            .push((domain, rtype))
            .expect("Vec-backed message builder never fails");

        Self {
            inner: inner.into_message(),
        }
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);

        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    /// The queried name, without the trailing root dot.
    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn qclass(&self) -> QueryClass {
        self.question().qclass()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }
}

impl TryFrom<&[u8]> for Query {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(slice)
    }
}

#[derive(Clone)]
pub struct Response {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("qid", &self.inner.header().id())
            .field("domain", &self.domain())
            .field("type", &self.qtype())
            .field("response_code", &self.response_code())
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Creates an empty, "NOERROR" response for the given query.
    pub fn no_error(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NOERROR).build()
    }

    pub fn servfail(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::SERVFAIL).build()
    }

    pub fn nxdomain(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NXDOMAIN).build()
    }

    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if !message.header().qr() {
            return Err(Error::NotAResponse);
        }

        let _ = message.sole_question()?;

        // Verify that we can parse all answer records up front so that
        // accessors below are infallible.
        for record in message.answer()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    /// Rewrites the transaction id, e.g. when serving a cached message.
    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);

        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.inner.header().rcode()
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.answer().into_iter().map(|r| {
            r.expect("verified in ctor")
                .into_any_record::<AllRecordData<_, _>>()
                .expect("verified in ctor")
        })
    }

    /// All A/AAAA addresses in the answer section.
    pub fn ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.records().filter_map(records::extract_ip)
    }

    pub fn answer_count(&self) -> usize {
        self.records().count()
    }

    /// The smallest TTL across the answer section, `None` for empty answers.
    pub fn min_ttl(&self) -> Option<Ttl> {
        self.records().map(|r| r.ttl()).min()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }

    fn answer(&self) -> RecordSection<'_, Vec<u8>> {
        self.inner.answer().expect("verified in ctor")
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(slice)
    }
}

pub struct ResponseBuilder {
    inner: AnswerBuilder<Vec<u8>>,
}

impl ResponseBuilder {
    pub fn for_query(query: &Query, code: ResponseCode) -> Self {
        let inner = MessageBuilder::new_vec()
            .start_answer(&query.inner, code)
            .expect("Vec-backed message builder never fails");

        Self { inner }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item: Into<OwnedRecord>>) -> Self {
        for record in records {
            self.inner
                .push(record.into())
                .expect("Vec-backed message builder never fails");
        }

        self
    }

    pub fn build(self) -> Response {
        Response {
            inner: self.inner.into_message(),
        }
    }
}

/// Reads the question count from a raw message without a full parse.
///
/// Returns `None` when the slice is too short to even hold a header.
pub fn question_count(slice: &[u8]) -> Option<u16> {
    Some(Message::from_octets(slice).ok()?.header_counts().qdcount())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bytes slice is too short to contain a message")]
    TooShort,
    #[error("DNS message is not a query")]
    NotAQuery,
    #[error("DNS message is not a response")]
    NotAResponse,
    #[error("DNS message has {0} questions instead of exactly one")]
    QuestionCount(u16),
    #[error(transparent)]
    Parse(#[from] domain::base::wire::ParseError),
}

impl Error {
    /// Messages we cannot classify but that are still well-formed enough to
    /// relay to an upstream verbatim.
    pub fn is_relayable(&self) -> bool {
        matches!(self, Error::QuestionCount(_))
    }
}

pub mod records {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use domain::rdata::{A, Aaaa};

    use super::*;

    pub fn a(ip: Ipv4Addr) -> OwnedRecordData {
        OwnedRecordData::A(A::new(ip))
    }

    pub fn aaaa(ip: Ipv6Addr) -> OwnedRecordData {
        OwnedRecordData::Aaaa(Aaaa::new(ip))
    }

    pub fn ip(ip: IpAddr) -> OwnedRecordData {
        match ip {
            IpAddr::V4(ip) => a(ip),
            IpAddr::V6(ip) => aaaa(ip),
        }
    }

    #[expect(
        clippy::wildcard_enum_match_arm,
        reason = "We only care about address records."
    )]
    pub fn extract_ip(record: Record<'_>) -> Option<IpAddr> {
        match record.into_data() {
            RecordData::A(a) => Some(a.addr().into()),
            RecordData::Aaaa(aaaa) => Some(aaaa.addr().into()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn query_roundtrip() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A).with_id(42);

        let parsed = Query::parse(query.as_bytes()).unwrap();

        assert_eq!(parsed.id(), 42);
        assert_eq!(parsed.domain(), domain);
        assert_eq!(parsed.qtype(), RecordType::A);
        assert_eq!(parsed.qclass(), QueryClass::IN);
    }

    #[test]
    fn response_exposes_ips_and_min_ttl() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A);

        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records([
                (domain.clone(), 600, records::a(Ipv4Addr::new(1, 2, 3, 4))),
                (domain.clone(), 60, records::a(Ipv4Addr::new(5, 6, 7, 8))),
            ])
            .build();

        let parsed = Response::parse(response.as_bytes()).unwrap();

        assert_eq!(
            parsed.ips().collect::<Vec<_>>(),
            vec![
                IpAddr::from([1, 2, 3, 4]),
                IpAddr::from([5, 6, 7, 8]),
            ]
        );
        assert_eq!(parsed.min_ttl(), Some(Ttl::from_secs(60)));
        assert_eq!(parsed.answer_count(), 2);
    }

    #[test]
    fn rewriting_the_id_keeps_the_answer_section() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A).with_id(7);

        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records([(domain, 300, records::a(Ipv4Addr::LOCALHOST))])
            .build();
        let original_answer = response.as_bytes()[12..].to_vec();

        let rewritten = response.with_id(9999);

        assert_eq!(rewritten.id(), 9999);
        assert_eq!(&rewritten.as_bytes()[12..], &original_answer[..]);
    }

    #[test]
    fn multi_question_messages_are_rejected_but_relayable() {
        let mut builder = MessageBuilder::new_vec().question();
        builder
            .push((
                DomainName::vec_from_str("a.example.com").unwrap(),
                RecordType::A,
            ))
            .unwrap();
        builder
            .push((
                DomainName::vec_from_str("b.example.com").unwrap(),
                RecordType::A,
            ))
            .unwrap();
        let bytes = builder.into_message().into_octets();

        let err = Query::parse(&bytes).unwrap_err();

        assert!(matches!(err, Error::QuestionCount(2)));
        assert!(err.is_relayable());
        assert_eq!(question_count(&bytes), Some(2));
    }

    #[test]
    fn nxdomain_has_no_records() {
        let query = Query::new(
            DomainName::vec_from_str("ads.example").unwrap(),
            RecordType::A,
        );

        let response = Response::nxdomain(&query);

        assert_eq!(response.response_code(), ResponseCode::NXDOMAIN);
        assert_eq!(response.id(), query.id());
        assert_eq!(response.answer_count(), 0);
    }
}
