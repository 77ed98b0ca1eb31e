//! Compact on-page encoding of record sets.
//!
//! A record set is one self-describing blob:
//!
//! ```text
//! off  size  field
//!   0     4  next record on the same page (u32::MAX = none)
//!   4     4  expiration time
//!   8     2  record type code
//!  10     2  total size of the blob
//!  12     1  negative flag (NODATA)
//!  13     1  number of records
//!  14     1  owner name length
//!  15   n+1  owner name, NUL terminated
//!   …        per-record payloads
//! ```
//!
//! Payload fields are aligned to their natural width relative to the blob
//! start; blobs themselves start at [`RECORD_ALIGN`] boundaries on a page, so
//! copying a blob between buffers keeps every field aligned. Strings are
//! stored as a length byte, the bytes, and a NUL.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::CacheError;
use crate::record::{CachedType, DnsData, DnsPayload, DnsStatus};

pub const RECORD_ALIGN: usize = 8;
pub const NO_RECORD: u32 = u32::MAX;

const OFF_NEXT: usize = 0;
const OFF_EXPIRATION: usize = 4;
const OFF_TYPE: usize = 8;
const OFF_SIZE: usize = 10;
const OFF_NEGATIVE: usize = 12;
const OFF_COUNT: usize = 13;
const OFF_NAME_LEN: usize = 14;
const OFF_NAME: usize = 15;

pub const HEADER_LEN: usize = OFF_NAME;

#[inline]
pub fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Scratch context that serializes one record set.
#[derive(Debug, Clone)]
pub struct RecordSetWriter {
    buf: Vec<u8>,
    limit: usize,
    rtype: CachedType,
    negative: bool,
    min_ttl: u32,
    count: u8,
}

impl RecordSetWriter {
    /// Starts a record set from its first answer. `limit` bounds the blob size.
    /// The owner is stored without its trailing dot.
    pub fn begin(first: &DnsData, limit: usize) -> Result<Self, CacheError> {
        let (rtype, negative) = first.cached_type()?;
        let name = first.owner.as_bytes();
        let name = name.strip_suffix(b".").unwrap_or(name);
        if name.len() > u8::MAX as usize {
            return Err(CacheError::FieldTooLong {
                field: "owner name",
                len: name.len(),
            });
        }
        let header = HEADER_LEN + name.len() + 1;
        if header > limit {
            return Err(CacheError::RecordTooLarge { size: header });
        }

        let mut buf = Vec::with_capacity(limit.min(512));
        buf.extend_from_slice(&NO_RECORD.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&rtype.code().to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.push(negative as u8);
        buf.push(0);
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        buf.push(0);

        Ok(Self {
            buf,
            limit,
            rtype,
            negative,
            min_ttl: u32::MAX,
            count: 0,
        })
    }

    /// Appends one answer of the same `(owner, type)`.
    pub fn push(&mut self, data: &DnsData) -> Result<(), CacheError> {
        let (rtype, negative) = data.cached_type()?;
        let owner = data.owner.as_bytes();
        let owner = owner.strip_suffix(b".").unwrap_or(owner);
        if !owner.eq_ignore_ascii_case(self.owner()) {
            return Err(CacheError::OwnerMismatch {
                expected: String::from_utf8_lossy(self.owner()).into_owned(),
                got: data.owner.clone(),
            });
        }
        if rtype != self.rtype || negative != self.negative {
            return Err(CacheError::TypeMismatch {
                expected: self.rtype.code(),
                got: rtype.code(),
            });
        }
        if self.count == u8::MAX {
            return Err(CacheError::FieldTooLong {
                field: "record set",
                len: self.count as usize + 1,
            });
        }

        let mark = self.buf.len();
        if let Err(err) = self.encode_payload(&data.payload) {
            self.buf.truncate(mark);
            return Err(err);
        }
        if self.buf.len() > self.limit {
            let size = self.buf.len();
            self.buf.truncate(mark);
            return Err(CacheError::RecordTooLarge { size });
        }

        self.count += 1;
        self.min_ttl = self.min_ttl.min(data.ttl);
        Ok(())
    }

    fn encode_payload(&mut self, payload: &DnsPayload) -> Result<(), CacheError> {
        match payload {
            // negative sets carry no payload
            DnsPayload::Status { .. } => Ok(()),
            DnsPayload::A { address } => {
                self.pad(4);
                self.buf.extend_from_slice(&address.octets());
                Ok(())
            }
            DnsPayload::Aaaa { address } => {
                self.buf.extend_from_slice(&address.octets());
                Ok(())
            }
            DnsPayload::Cname { alias } => self.put_str("cname alias", alias),
            DnsPayload::Srv {
                port,
                priority,
                weight,
                target,
            } => {
                check_len("srv target", target)?;
                self.pad(2);
                self.put_u16(*port);
                self.put_u16(*priority);
                self.put_u16(*weight);
                self.put_str("srv target", target)
            }
            DnsPayload::Naptr {
                order,
                preference,
                flags,
                service,
                regexp,
                replacement,
            } => {
                check_len("naptr flags", flags)?;
                check_len("naptr service", service)?;
                check_len("naptr regexp", regexp)?;
                check_len("naptr replacement", replacement)?;
                self.pad(2);
                self.put_u16(*order);
                self.put_u16(*preference);
                self.put_str("naptr flags", flags)?;
                self.put_str("naptr service", service)?;
                self.put_str("naptr regexp", regexp)?;
                self.put_str("naptr replacement", replacement)
            }
            DnsPayload::EndOfList => Err(CacheError::BadParam(
                "end of list marker can't be cached".into(),
            )),
        }
    }

    fn pad(&mut self, align: usize) {
        let target = align_up(self.buf.len(), align);
        self.buf.resize(target, 0);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, field: &'static str, s: &str) -> Result<(), CacheError> {
        check_len(field, s)?;
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub fn rtype(&self) -> CachedType {
        self.rtype
    }

    pub fn negative(&self) -> bool {
        self.negative
    }

    /// Minimal TTL over all answers pushed so far.
    pub fn min_ttl(&self) -> u32 {
        if self.count == 0 { 0 } else { self.min_ttl }
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn owner(&self) -> &[u8] {
        let len = self.buf[OFF_NAME_LEN] as usize;
        &self.buf[OFF_NAME..OFF_NAME + len]
    }

    /// Final blob with size, count and expiration stamped into the header.
    pub fn seal(&self, expiration: u32) -> Vec<u8> {
        let mut out = self.buf.clone();
        let size = out.len() as u16;
        out[OFF_EXPIRATION..OFF_EXPIRATION + 4].copy_from_slice(&expiration.to_le_bytes());
        out[OFF_SIZE..OFF_SIZE + 2].copy_from_slice(&size.to_le_bytes());
        out[OFF_COUNT] = self.count;
        out
    }
}

fn check_len(field: &'static str, s: &str) -> Result<(), CacheError> {
    if s.len() > u8::MAX as usize {
        return Err(CacheError::FieldTooLong {
            field,
            len: s.len(),
        });
    }
    Ok(())
}

/// Encodes a complete answer list into one blob; used for results that
/// never touch a page (local hosts answers).
pub fn encode_set(answers: &[DnsData], limit: usize, expiration: u32) -> Result<Vec<u8>, CacheError> {
    let first = answers
        .first()
        .ok_or_else(|| CacheError::BadParam("empty answer list".into()))?;
    let mut writer = RecordSetWriter::begin(first, limit)?;
    for data in answers {
        writer.push(data)?;
    }
    Ok(writer.seal(expiration))
}

/// Read-only view over an encoded record set.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// `bytes` may extend past the record; the view is cut to the stored size.
    pub fn new(bytes: &'a [u8]) -> Result<Self, CacheError> {
        if bytes.len() < HEADER_LEN + 1 {
            return Err(CacheError::Corrupted("record header truncated"));
        }
        let size = u16::from_le_bytes([bytes[OFF_SIZE], bytes[OFF_SIZE + 1]]) as usize;
        let name_end = OFF_NAME + bytes[OFF_NAME_LEN] as usize + 1;
        if size < name_end || size > bytes.len() {
            return Err(CacheError::Corrupted("record size out of bounds"));
        }
        Ok(Self {
            bytes: &bytes[..size],
        })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn u16_at(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.bytes[off], self.bytes[off + 1]])
    }

    fn u32_at(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[off],
            self.bytes[off + 1],
            self.bytes[off + 2],
            self.bytes[off + 3],
        ])
    }

    pub fn next_on_page(&self) -> Option<u32> {
        match self.u32_at(OFF_NEXT) {
            NO_RECORD => None,
            next => Some(next),
        }
    }

    pub fn expiration(&self) -> u32 {
        self.u32_at(OFF_EXPIRATION)
    }

    pub fn type_code(&self) -> u16 {
        self.u16_at(OFF_TYPE)
    }

    pub fn rtype(&self) -> Option<CachedType> {
        CachedType::from_code(self.type_code())
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// NODATA record set.
    pub fn negative(&self) -> bool {
        self.bytes[OFF_NEGATIVE] != 0
    }

    /// NODATA or NXDOMAIN.
    pub fn is_negative_answer(&self) -> bool {
        self.negative() || self.type_code() == CachedType::NXDOMAIN_CODE
    }

    pub fn count(&self) -> u8 {
        self.bytes[OFF_COUNT]
    }

    pub fn name_bytes(&self) -> &'a [u8] {
        let len = self.bytes[OFF_NAME_LEN] as usize;
        &self.bytes[OFF_NAME..OFF_NAME + len]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    fn payload_offset(&self) -> usize {
        OFF_NAME + self.bytes[OFF_NAME_LEN] as usize + 1
    }

    /// Alias of the first record in a positive CNAME set.
    pub fn cname_target(&self) -> Result<&'a [u8], CacheError> {
        if self.rtype() != Some(CachedType::Cname) || self.negative() || self.count() == 0 {
            return Err(CacheError::Corrupted("not a positive cname record"));
        }
        Reader::new(self.bytes, self.payload_offset()).str_bytes()
    }

    /// Re-derives the answers stored in this record set.
    pub fn decode(&self) -> Result<DecodedSet, CacheError> {
        let owner = self.name();
        let rtype = self
            .rtype()
            .ok_or(CacheError::UnexpectedType(self.type_code()))?;

        if self.is_negative_answer() {
            let status = if self.negative() {
                DnsStatus::NoData
            } else {
                DnsStatus::NotFound
            };
            return Ok(DecodedSet {
                owner,
                rtype,
                expiration: self.expiration(),
                negative: Some(status),
                records: Vec::new(),
            });
        }

        let mut reader = Reader::new(self.bytes, self.payload_offset());
        let mut records = Vec::with_capacity(self.count() as usize);
        for i in 0..self.count() {
            let payload = reader.payload(rtype)?;
            records.push(DnsData {
                owner: owner.clone(),
                ttl: 0,
                query_type: Some(rtype),
                record_number: i as u32 + 1,
                payload,
            });
        }

        Ok(DecodedSet {
            owner,
            rtype,
            expiration: self.expiration(),
            negative: None,
            records,
        })
    }
}

/// Result of decoding a record set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSet {
    pub owner: String,
    pub rtype: CachedType,
    pub expiration: u32,
    /// `Some` for NXDOMAIN / NODATA sets.
    pub negative: Option<DnsStatus>,
    pub records: Vec<DnsData>,
}

impl DecodedSet {
    /// Status record reported for a negative set queried with `query_type`.
    pub fn status_record(&self, query_type: CachedType) -> Option<DnsData> {
        self.negative
            .map(|status| DnsData::status(self.owner.clone(), query_type, status, 0))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CacheError> {
        let end = self.pos + n;
        let out = self
            .bytes
            .get(self.pos..end)
            .ok_or(CacheError::Corrupted("payload truncated"))?;
        self.pos = end;
        Ok(out)
    }

    fn align(&mut self, align: usize) {
        self.pos = align_up(self.pos, align);
    }

    fn u16(&mut self) -> Result<u16, CacheError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn str_bytes(&mut self) -> Result<&'a [u8], CacheError> {
        let len = self.take(1)?[0] as usize;
        let s = self.take(len)?;
        self.take(1)?;
        Ok(s)
    }

    fn string(&mut self) -> Result<String, CacheError> {
        Ok(String::from_utf8_lossy(self.str_bytes()?).into_owned())
    }

    fn payload(&mut self, rtype: CachedType) -> Result<DnsPayload, CacheError> {
        match rtype {
            CachedType::A => {
                self.align(4);
                let b = self.take(4)?;
                Ok(DnsPayload::A {
                    address: Ipv4Addr::new(b[0], b[1], b[2], b[3]),
                })
            }
            CachedType::Aaaa => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                Ok(DnsPayload::Aaaa {
                    address: Ipv6Addr::from(octets),
                })
            }
            CachedType::Cname => Ok(DnsPayload::Cname {
                alias: self.string()?,
            }),
            CachedType::Srv => {
                self.align(2);
                let port = self.u16()?;
                let priority = self.u16()?;
                let weight = self.u16()?;
                Ok(DnsPayload::Srv {
                    port,
                    priority,
                    weight,
                    target: self.string()?,
                })
            }
            CachedType::Naptr => {
                self.align(2);
                let order = self.u16()?;
                let preference = self.u16()?;
                Ok(DnsPayload::Naptr {
                    order,
                    preference,
                    flags: self.string()?,
                    service: self.string()?,
                    regexp: self.string()?,
                    replacement: self.string()?,
                })
            }
            CachedType::NxDomain => Err(CacheError::Corrupted("payload on nxdomain record")),
        }
    }
}

/// Patches the next-on-page link of a blob already placed on a page.
pub(crate) fn set_next_on_page(bytes: &mut [u8], next: Option<u32>) {
    let v = next.unwrap_or(NO_RECORD);
    bytes[OFF_NEXT..OFF_NEXT + 4].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(answers: Vec<DnsData>) -> DecodedSet {
        let blob = encode_set(&answers, 4096, 77).expect("encode");
        let view = RecordView::new(&blob).expect("view");
        assert_eq!(view.size(), blob.len());
        assert_eq!(view.expiration(), 77);
        view.decode().expect("decode")
    }

    fn assert_same(original: &[DnsData], decoded: &DecodedSet) {
        assert_eq!(decoded.records.len(), original.len());
        for (i, (a, b)) in original.iter().zip(&decoded.records).enumerate() {
            assert_eq!(a.owner, b.owner);
            assert_eq!(a.payload, b.payload);
            assert_eq!(b.record_number, i as u32 + 1);
        }
    }

    #[test]
    fn every_positive_type_round_trips() {
        let sets = vec![
            vec![
                DnsData::a("Host.Example", 30, Ipv4Addr::new(192, 0, 2, 1)),
                DnsData::a("Host.Example", 20, Ipv4Addr::new(192, 0, 2, 2)),
            ],
            vec![DnsData::aaaa(
                "v6.example",
                30,
                "2001:db8::1".parse().unwrap(),
            )],
            vec![DnsData::cname("foo.example", 30, "alias.example")],
            vec![DnsData::new(
                "_sip._udp.example",
                30,
                DnsPayload::Srv {
                    port: 5060,
                    priority: 1,
                    weight: 2,
                    target: "pbx.example".into(),
                },
            )],
            vec![DnsData::new(
                "example",
                30,
                DnsPayload::Naptr {
                    order: 50,
                    preference: 51,
                    flags: "s".into(),
                    service: "SIPS+D2T".into(),
                    regexp: "!^.*$!sip:info@example!".into(),
                    replacement: ".".into(),
                },
            )],
        ];

        for answers in sets {
            let decoded = round_trip(answers.clone());
            assert_eq!(decoded.negative, None);
            assert_same(&answers, &decoded);
        }
    }

    #[test]
    fn negative_sets_carry_no_payload() {
        let nx = vec![DnsData::status("bar.example", CachedType::A, DnsStatus::NotFound, 60)];
        let decoded = round_trip(nx);
        assert_eq!(decoded.rtype, CachedType::NxDomain);
        assert_eq!(decoded.negative, Some(DnsStatus::NotFound));
        let status = decoded.status_record(CachedType::A).unwrap();
        assert_eq!(
            status,
            DnsData::status("bar.example", CachedType::A, DnsStatus::NotFound, 0)
        );

        let nodata = vec![DnsData::status("bar.example", CachedType::Srv, DnsStatus::NoData, 60)];
        let decoded = round_trip(nodata);
        assert_eq!(decoded.rtype, CachedType::Srv);
        assert_eq!(decoded.negative, Some(DnsStatus::NoData));
        assert!(decoded.records.is_empty());
    }

    #[test]
    fn writer_tracks_min_ttl_and_rejects_mixed_types() {
        let first = DnsData::a("h.example", 300, Ipv4Addr::LOCALHOST);
        let mut writer = RecordSetWriter::begin(&first, 4096).unwrap();
        writer.push(&first).unwrap();
        writer
            .push(&DnsData::a("h.example", 45, Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();
        assert_eq!(writer.min_ttl(), 45);
        assert_eq!(writer.count(), 2);

        let err = writer
            .push(&DnsData::cname("h.example", 10, "x.example"))
            .unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch { .. }));
        assert_eq!(writer.count(), 2);
    }

    #[test]
    fn writer_rejects_other_owners() {
        let first = DnsData::a("x.example", 60, Ipv4Addr::new(192, 0, 2, 1));
        let mut writer = RecordSetWriter::begin(&first, 4096).unwrap();
        writer.push(&first).unwrap();
        writer
            .push(&DnsData::a("X.Example.", 60, Ipv4Addr::new(192, 0, 2, 2)))
            .unwrap();

        let err = writer
            .push(&DnsData::a("evil.example", 60, Ipv4Addr::new(6, 6, 6, 6)))
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::OwnerMismatch {
                expected: "x.example".into(),
                got: "evil.example".into()
            }
        );
        assert_eq!(writer.count(), 2);
    }

    #[test]
    fn overlong_strings_are_malformed() {
        let long = "x".repeat(256);
        let err = encode_set(&[DnsData::cname("foo.example", 30, long.clone())], 4096, 0)
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::FieldTooLong {
                field: "cname alias",
                len: 256
            }
        );

        let err = encode_set(&[DnsData::a(long, 30, Ipv4Addr::LOCALHOST)], 4096, 0).unwrap_err();
        assert!(matches!(err, CacheError::FieldTooLong { field: "owner name", .. }));
    }

    #[test]
    fn oversized_set_is_reported() {
        let first = DnsData::a("h.example", 30, Ipv4Addr::LOCALHOST);
        // header and owner end at 25, the first address at 32, a second one would end at 36
        let mut writer = RecordSetWriter::begin(&first, 34).unwrap();
        writer.push(&first).unwrap();
        let err = writer
            .push(&DnsData::a("h.example", 30, Ipv4Addr::LOCALHOST))
            .unwrap_err();
        assert!(matches!(err, CacheError::RecordTooLarge { .. }));
    }

    #[test]
    fn payload_fields_are_aligned() {
        // 15 byte header + "ab" + NUL = 18, so the port starts at 18 and the address at 20
        let srv = encode_set(
            &[DnsData::new(
                "ab",
                1,
                DnsPayload::Srv {
                    port: 0x1234,
                    priority: 0,
                    weight: 0,
                    target: String::new(),
                },
            )],
            4096,
            0,
        )
        .unwrap();
        assert_eq!(&srv[18..20], &0x1234u16.to_le_bytes());

        let a = encode_set(&[DnsData::a("ab", 1, Ipv4Addr::new(1, 2, 3, 4))], 4096, 0).unwrap();
        assert_eq!(&a[20..24], &[1, 2, 3, 4]);
    }

    #[test]
    fn cname_target_reads_first_alias() {
        let blob = encode_set(&[DnsData::cname("foo.example", 30, "Alias.Example")], 4096, 0).unwrap();
        let view = RecordView::new(&blob).unwrap();
        assert_eq!(view.cname_target().unwrap(), b"Alias.Example");
    }
}
