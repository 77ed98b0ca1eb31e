use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::rr::{Name, RData, Record, RecordType};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Record types the cache stores, plus the NXDOMAIN pseudo-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CachedType {
    A,
    Aaaa,
    Cname,
    Srv,
    Naptr,
    /// Negative answer for the whole owner name.
    NxDomain,
}

impl CachedType {
    /// Private-use code; its low byte does not collide with any cached type.
    pub const NXDOMAIN_CODE: u16 = 0xff00;

    pub fn code(self) -> u16 {
        match self {
            CachedType::A => 1,
            CachedType::Cname => 5,
            CachedType::Aaaa => 28,
            CachedType::Srv => 33,
            CachedType::Naptr => 35,
            CachedType::NxDomain => Self::NXDOMAIN_CODE,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(CachedType::A),
            5 => Some(CachedType::Cname),
            28 => Some(CachedType::Aaaa),
            33 => Some(CachedType::Srv),
            35 => Some(CachedType::Naptr),
            Self::NXDOMAIN_CODE => Some(CachedType::NxDomain),
            _ => None,
        }
    }

    pub fn from_record_type(rtype: RecordType) -> Option<Self> {
        match rtype {
            RecordType::A => Some(CachedType::A),
            RecordType::AAAA => Some(CachedType::Aaaa),
            RecordType::CNAME => Some(CachedType::Cname),
            RecordType::SRV => Some(CachedType::Srv),
            RecordType::NAPTR => Some(CachedType::Naptr),
            _ => None,
        }
    }

    /// `None` for the NXDOMAIN pseudo-type, which has no wire type.
    pub fn record_type(self) -> Option<RecordType> {
        match self {
            CachedType::A => Some(RecordType::A),
            CachedType::Aaaa => Some(RecordType::AAAA),
            CachedType::Cname => Some(RecordType::CNAME),
            CachedType::Srv => Some(RecordType::SRV),
            CachedType::Naptr => Some(RecordType::NAPTR),
            CachedType::NxDomain => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CachedType::A => "A",
            CachedType::Aaaa => "AAAA",
            CachedType::Cname => "CNAME",
            CachedType::Srv => "SRV",
            CachedType::Naptr => "NAPTR",
            CachedType::NxDomain => "NXDOMAIN",
        }
    }
}

impl fmt::Display for CachedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachedType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(CachedType::A),
            "AAAA" => Ok(CachedType::Aaaa),
            "CNAME" => Ok(CachedType::Cname),
            "SRV" => Ok(CachedType::Srv),
            "NAPTR" => Ok(CachedType::Naptr),
            "NXDOMAIN" => Ok(CachedType::NxDomain),
            other => Err(CacheError::BadParam(format!("unknown record type {other}"))),
        }
    }
}

/// Outcome carried by a status (negative) answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsStatus {
    /// NXDOMAIN: the owner name does not exist.
    NotFound,
    /// NODATA: the name exists but has no records of the queried type.
    NoData,
    /// Any other resolution failure; never cached.
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnsPayload {
    A {
        address: Ipv4Addr,
    },
    Aaaa {
        address: Ipv6Addr,
    },
    Cname {
        alias: String,
    },
    Srv {
        port: u16,
        priority: u16,
        weight: u16,
        target: String,
    },
    Naptr {
        order: u16,
        preference: u16,
        flags: String,
        service: String,
        regexp: String,
        replacement: String,
    },
    Status {
        status: DnsStatus,
    },
    /// Terminates a delivered record set.
    EndOfList,
}

/// One parsed DNS answer, as fed into the cache and as delivered back to callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsData {
    pub owner: String,
    #[serde(default)]
    pub ttl: u32,
    /// Type that was queried; required for NODATA answers.
    #[serde(default)]
    pub query_type: Option<CachedType>,
    /// 1-based position inside a delivered record set, 0 for status records.
    #[serde(default)]
    pub record_number: u32,
    #[serde(flatten)]
    pub payload: DnsPayload,
}

impl DnsData {
    pub fn new(owner: impl Into<String>, ttl: u32, payload: DnsPayload) -> Self {
        let mut data = Self {
            owner: owner.into(),
            ttl,
            query_type: None,
            record_number: 0,
            payload,
        };
        data.query_type = data.data_type();
        data
    }

    pub fn a(owner: impl Into<String>, ttl: u32, address: Ipv4Addr) -> Self {
        Self::new(owner, ttl, DnsPayload::A { address })
    }

    pub fn aaaa(owner: impl Into<String>, ttl: u32, address: Ipv6Addr) -> Self {
        Self::new(owner, ttl, DnsPayload::Aaaa { address })
    }

    pub fn cname(owner: impl Into<String>, ttl: u32, alias: impl Into<String>) -> Self {
        Self::new(owner, ttl, DnsPayload::Cname { alias: alias.into() })
    }

    /// Negative answer for `owner` queried with `query_type`.
    pub fn status(
        owner: impl Into<String>,
        query_type: CachedType,
        status: DnsStatus,
        ttl: u32,
    ) -> Self {
        Self {
            owner: owner.into(),
            ttl,
            query_type: Some(query_type),
            record_number: 0,
            payload: DnsPayload::Status { status },
        }
    }

    pub(crate) fn end_of_list(owner: &str, query_type: CachedType) -> Self {
        Self {
            owner: owner.to_string(),
            ttl: 0,
            query_type: Some(query_type),
            record_number: 0,
            payload: DnsPayload::EndOfList,
        }
    }

    /// Type of positive data carried by this answer.
    pub fn data_type(&self) -> Option<CachedType> {
        match self.payload {
            DnsPayload::A { .. } => Some(CachedType::A),
            DnsPayload::Aaaa { .. } => Some(CachedType::Aaaa),
            DnsPayload::Cname { .. } => Some(CachedType::Cname),
            DnsPayload::Srv { .. } => Some(CachedType::Srv),
            DnsPayload::Naptr { .. } => Some(CachedType::Naptr),
            DnsPayload::Status { .. } | DnsPayload::EndOfList => None,
        }
    }

    /// The `(type, negative)` pair this answer is cached under.
    pub fn cached_type(&self) -> Result<(CachedType, bool), CacheError> {
        if let Some(rtype) = self.data_type() {
            return Ok((rtype, false));
        }
        match self.payload {
            DnsPayload::Status {
                status: DnsStatus::NotFound,
            } => Ok((CachedType::NxDomain, false)),
            DnsPayload::Status {
                status: DnsStatus::NoData,
            } => match self.query_type {
                Some(qtype) if qtype != CachedType::NxDomain => Ok((qtype, true)),
                _ => Err(CacheError::BadParam(format!(
                    "NODATA answer for {} without a query type",
                    self.owner
                ))),
            },
            DnsPayload::Status { .. } => Err(CacheError::UnexpectedStatus {
                owner: self.owner.clone(),
            }),
            _ => Err(CacheError::BadParam("end of list marker can't be cached".into())),
        }
    }

    pub fn is_status(&self) -> bool {
        matches!(self.payload, DnsPayload::Status { .. })
    }

    /// Converts a parsed hickory answer; see the `TryFrom` impl.
    pub fn from_record(record: &Record) -> Result<Self, CacheError> {
        Self::try_from(record)
    }
}

impl TryFrom<&Record> for DnsData {
    type Error = CacheError;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        let payload = match record.data() {
            Some(RData::A(a)) => DnsPayload::A { address: a.0 },
            Some(RData::AAAA(aaaa)) => DnsPayload::Aaaa { address: aaaa.0 },
            Some(RData::CNAME(cname)) => DnsPayload::Cname {
                alias: name_to_string(&cname.0),
            },
            Some(RData::SRV(srv)) => DnsPayload::Srv {
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
                target: name_to_string(srv.target()),
            },
            Some(RData::NAPTR(naptr)) => DnsPayload::Naptr {
                order: naptr.order(),
                preference: naptr.preference(),
                flags: String::from_utf8_lossy(naptr.flags()).into_owned(),
                service: String::from_utf8_lossy(naptr.services()).into_owned(),
                regexp: String::from_utf8_lossy(naptr.regexp()).into_owned(),
                replacement: name_to_string(naptr.replacement()),
            },
            _ => return Err(CacheError::UnexpectedType(u16::from(record.record_type()))),
        };
        Ok(DnsData::new(name_to_string(record.name()), record.ttl(), payload))
    }
}

/// Presentation form without the root dot.
fn name_to_string(name: &Name) -> String {
    let mut s = name.to_utf8();
    if s.len() > 1 && s.ends_with('.') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, CNAME, NAPTR, SRV};

    #[test]
    fn cached_type_codes_round_trip() {
        for t in [
            CachedType::A,
            CachedType::Aaaa,
            CachedType::Cname,
            CachedType::Srv,
            CachedType::Naptr,
            CachedType::NxDomain,
        ] {
            assert_eq!(CachedType::from_code(t.code()), Some(t));
            assert_eq!(t.as_str().parse::<CachedType>().unwrap(), t);
        }
        assert_eq!(CachedType::from_code(15), None);
        assert!("MX".parse::<CachedType>().is_err());
    }

    #[test]
    fn status_answers_map_to_cached_types() {
        let nx = DnsData::status("bar.example", CachedType::A, DnsStatus::NotFound, 60);
        assert_eq!(nx.cached_type().unwrap(), (CachedType::NxDomain, false));

        let nodata = DnsData::status("bar.example", CachedType::Srv, DnsStatus::NoData, 60);
        assert_eq!(nodata.cached_type().unwrap(), (CachedType::Srv, true));

        let failed = DnsData::status("bar.example", CachedType::A, DnsStatus::Failure, 60);
        assert!(matches!(
            failed.cached_type(),
            Err(CacheError::UnexpectedStatus { .. })
        ));
    }

    #[test]
    fn converts_hickory_records() {
        let name = Name::from_str("sip.example.com.").unwrap();
        let a = Record::from_rdata(name.clone(), 120, RData::A(A(Ipv4Addr::new(192, 0, 2, 7))));
        let data = DnsData::try_from(&a).unwrap();
        assert_eq!(data.owner, "sip.example.com");
        assert_eq!(data.ttl, 120);
        assert_eq!(
            data.payload,
            DnsPayload::A {
                address: Ipv4Addr::new(192, 0, 2, 7)
            }
        );

        let target = Name::from_str("proxy.example.com.").unwrap();
        let srv = Record::from_rdata(name.clone(), 30, RData::SRV(SRV::new(10, 60, 5060, target)));
        let data = DnsData::try_from(&srv).unwrap();
        assert_eq!(data.query_type, Some(CachedType::Srv));
        assert_eq!(
            data.payload,
            DnsPayload::Srv {
                port: 5060,
                priority: 10,
                weight: 60,
                target: "proxy.example.com".into()
            }
        );

        let alias = Name::from_str("alias.example.com.").unwrap();
        let cname = Record::from_rdata(name.clone(), 30, RData::CNAME(CNAME(alias)));
        let data = DnsData::try_from(&cname).unwrap();
        assert_eq!(
            data.payload,
            DnsPayload::Cname {
                alias: "alias.example.com".into()
            }
        );

        let naptr = Record::from_rdata(
            name,
            30,
            RData::NAPTR(NAPTR::new(
                100,
                10,
                b"s".to_vec().into_boxed_slice(),
                b"SIP+D2U".to_vec().into_boxed_slice(),
                Vec::new().into_boxed_slice(),
                Name::from_str("_sip._udp.example.com.").unwrap(),
            )),
        );
        let data = DnsData::try_from(&naptr).unwrap();
        assert_eq!(
            data.payload,
            DnsPayload::Naptr {
                order: 100,
                preference: 10,
                flags: "s".into(),
                service: "SIP+D2U".into(),
                regexp: String::new(),
                replacement: "_sip._udp.example.com".into()
            }
        );
    }

    #[test]
    fn answers_deserialize_from_json() {
        let raw = serde_json::json!([
            { "owner": "a.example", "ttl": 60, "type": "a", "address": "192.0.2.1" },
            { "owner": "b.example", "ttl": 60, "query_type": "SRV", "type": "status", "status": "no_data" }
        ]);
        let answers: Vec<DnsData> = serde_json::from_value(raw).expect("parse answers");
        assert_eq!(answers[0].data_type(), Some(CachedType::A));
        assert_eq!(answers[1].cached_type().unwrap(), (CachedType::Srv, true));
    }
}
