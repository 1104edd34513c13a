//! mDNS packet encoding and decoding.
//!
//! Only the record types the gateway speaks (A, PTR, SRV, TXT) are decoded into
//! answers; other resource records are skipped. Names are written without
//! compression and read with compression pointers.

use std::net::Ipv4Addr;
use thiserror::Error;

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const CLASS_IN: u16 = 1;
const CLASS_MASK: u16 = 0x7fff;
const CACHE_FLUSH_BIT: u16 = 0x8000;
const UNICAST_RESPONSE_BIT: u16 = 0x8000;
const POINTER_MASK: u8 = 0xc0;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated at offset {0}")]
    Truncated(usize),

    #[error("invalid label at offset {0}")]
    InvalidLabel(usize),

    #[error("compression pointer loop at offset {0}")]
    PointerLoop(usize),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("label too long in {0}")]
    LabelTooLong(String),

    #[error("TXT string longer than 255 bytes")]
    TxtTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ptr,
    Txt,
    Srv,
    Any,
    Other(u16),
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ptr => 12,
            RecordType::Txt => 16,
            RecordType::Srv => 33,
            RecordType::Any => 255,
            RecordType::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            12 => RecordType::Ptr,
            16 => RecordType::Txt,
            33 => RecordType::Srv,
            255 => RecordType::Any,
            other => RecordType::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Query,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub record_type: RecordType,
    pub unicast_response: bool,
}

impl Question {
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            name: name.into(),
            record_type,
            unicast_response: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<Vec<u8>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub cache_flush: bool,
    pub data: RecordData,
}

impl Record {
    pub fn new(name: impl Into<String>, ttl: u32, data: RecordData) -> Self {
        Self {
            name: name.into(),
            ttl,
            cache_flush: false,
            data,
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self.data {
            RecordData::A(_) => RecordType::A,
            RecordData::Ptr(_) => RecordType::Ptr,
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Txt(_) => RecordType::Txt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u16,
    pub kind: PacketKind,
    pub authoritative: bool,
    pub questions: Vec<Question>,
    /// Answer, authority and additional sections, in that order
    pub answers: Vec<Record>,
}

impl Packet {
    pub fn query(questions: Vec<Question>) -> Self {
        Self {
            id: 0,
            kind: PacketKind::Query,
            authoritative: false,
            questions,
            answers: Vec::new(),
        }
    }

    pub fn response(answers: Vec<Record>) -> Self {
        Self {
            id: 0,
            kind: PacketKind::Response,
            authoritative: true,
            questions: Vec::new(),
            answers,
        }
    }
}

/// Normalize a DNS name for comparisons: lowercase, no trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(512);

    let mut flags = 0u16;
    if packet.kind == PacketKind::Response {
        flags |= FLAG_RESPONSE;
    }
    if packet.authoritative {
        flags |= FLAG_AUTHORITATIVE;
    }

    out.extend_from_slice(&packet.id.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&(packet.questions.len() as u16).to_be_bytes());
    out.extend_from_slice(&(packet.answers.len() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());

    for question in &packet.questions {
        encode_name(&question.name, &mut out)?;
        let mut class = CLASS_IN;
        if question.unicast_response {
            class |= UNICAST_RESPONSE_BIT;
        }
        out.extend_from_slice(&question.record_type.code().to_be_bytes());
        out.extend_from_slice(&class.to_be_bytes());
    }

    for record in &packet.answers {
        encode_record(record, &mut out)?;
    }

    Ok(out)
}

fn encode_record(record: &Record, out: &mut Vec<u8>) -> Result<(), WireError> {
    encode_name(&record.name, out)?;
    let mut class = CLASS_IN;
    if record.cache_flush {
        class |= CACHE_FLUSH_BIT;
    }
    out.extend_from_slice(&record.record_type().code().to_be_bytes());
    out.extend_from_slice(&class.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match &record.data {
        RecordData::A(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Ptr(target) => encode_name(target, &mut rdata)?,
        RecordData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            rdata.extend_from_slice(&priority.to_be_bytes());
            rdata.extend_from_slice(&weight.to_be_bytes());
            rdata.extend_from_slice(&port.to_be_bytes());
            encode_name(target, &mut rdata)?;
        }
        RecordData::Txt(strings) => {
            // An empty TXT record still carries one zero-length string
            if strings.is_empty() {
                rdata.push(0);
            }
            for s in strings {
                if s.len() > 255 {
                    return Err(WireError::TxtTooLong);
                }
                rdata.push(s.len() as u8);
                rdata.extend_from_slice(s);
            }
        }
    }

    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
    Ok(())
}

fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<(), WireError> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.to_string()));
    }
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(WireError::LabelTooLong(name.to_string()));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    Ok(())
}

pub fn decode(buf: &[u8]) -> Result<Packet, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated(buf.len()));
    }

    let id = read_u16(buf, 0)?;
    let flags = read_u16(buf, 2)?;
    let question_count = read_u16(buf, 4)? as usize;
    let record_count =
        read_u16(buf, 6)? as usize + read_u16(buf, 8)? as usize + read_u16(buf, 10)? as usize;

    let mut offset = HEADER_LEN;
    let mut questions = Vec::with_capacity(question_count.min(64));
    for _ in 0..question_count {
        let (name, next) = decode_name(buf, offset)?;
        let record_type = RecordType::from_code(read_u16(buf, next)?);
        let class = read_u16(buf, next + 2)?;
        offset = next + 4;
        questions.push(Question {
            name,
            record_type,
            unicast_response: class & UNICAST_RESPONSE_BIT != 0,
        });
    }

    let mut answers = Vec::with_capacity(record_count.min(64));
    for _ in 0..record_count {
        let (name, next) = decode_name(buf, offset)?;
        let code = read_u16(buf, next)?;
        let class = read_u16(buf, next + 2)?;
        let ttl = read_u32(buf, next + 4)?;
        let rdlen = read_u16(buf, next + 8)? as usize;
        let start = next + 10;
        let end = start + rdlen;
        if end > buf.len() {
            return Err(WireError::Truncated(start));
        }
        offset = end;

        if class & CLASS_MASK != CLASS_IN {
            continue;
        }

        let data = match RecordType::from_code(code) {
            RecordType::A if rdlen == 4 => {
                RecordData::A(Ipv4Addr::new(buf[start], buf[start + 1], buf[start + 2], buf[start + 3]))
            }
            RecordType::Ptr => RecordData::Ptr(decode_name(buf, start)?.0),
            RecordType::Srv if rdlen >= 7 => RecordData::Srv {
                priority: read_u16(buf, start)?,
                weight: read_u16(buf, start + 2)?,
                port: read_u16(buf, start + 4)?,
                target: decode_name(buf, start + 6)?.0,
            },
            RecordType::Txt => RecordData::Txt(decode_txt(&buf[start..end])?),
            _ => continue,
        };

        answers.push(Record {
            name,
            ttl,
            cache_flush: class & CACHE_FLUSH_BIT != 0,
            data,
        });
    }

    Ok(Packet {
        id,
        kind: if flags & FLAG_RESPONSE != 0 {
            PacketKind::Response
        } else {
            PacketKind::Query
        },
        authoritative: flags & FLAG_AUTHORITATIVE != 0,
        questions,
        answers,
    })
}

/// Read a possibly-compressed name at `offset`, returning it and the offset just
/// past it in the original byte stream.
fn decode_name(buf: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *buf.get(pos).ok_or(WireError::Truncated(pos))?;
        if len & POINTER_MASK == POINTER_MASK {
            let low = *buf.get(pos + 1).ok_or(WireError::Truncated(pos + 1))?;
            if end.is_none() {
                end = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(WireError::PointerLoop(offset));
            }
            pos = (((len & !POINTER_MASK) as usize) << 8) | low as usize;
            continue;
        }
        if len & POINTER_MASK != 0 {
            return Err(WireError::InvalidLabel(pos));
        }
        if len == 0 {
            pos += 1;
            break;
        }

        let start = pos + 1;
        let stop = start + len as usize;
        let bytes = buf.get(start..stop).ok_or(WireError::Truncated(start))?;
        labels.push(String::from_utf8_lossy(bytes).into_owned());
        pos = stop;
    }

    let name = labels.join(".");
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name));
    }
    Ok((name, end.unwrap_or(pos)))
}

fn decode_txt(rdata: &[u8]) -> Result<Vec<Vec<u8>>, WireError> {
    let mut strings = Vec::new();
    let mut pos = 0;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        let start = pos + 1;
        let stop = start + len;
        let bytes = rdata.get(start..stop).ok_or(WireError::Truncated(start))?;
        if !bytes.is_empty() {
            strings.push(bytes.to_vec());
        }
        pos = stop;
    }
    Ok(strings)
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, WireError> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(WireError::Truncated(offset))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, WireError> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(WireError::Truncated(offset))
}
