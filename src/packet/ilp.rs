//! ILP packets in their OER encoding. Every packet is a type byte followed by its contents as a
//!  variable-length octet string:
//!
//! ```ascii
//! Prepare (12): amount u64 | expires_at 'YYYYMMDDHHmmssfff' (17 bytes, UTC) | condition (32 bytes)
//!               | destination (var-string) | data (var-octets)
//! Fulfill (13): fulfillment (32 bytes) | data (var-octets)
//! Reject (14):  code (3 bytes) | triggered_by (var-string) | message (var-string) | data (var-octets)
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::length_prefix::{put_length_prefix, serialized_len, try_get_length_prefix};
use crate::packet::{PacketCodec, PayloadKind, Rejection};


#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum IlpPacketType {
    Prepare = 12,
    Fulfill = 13,
    Reject = 14,
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IlpPrepare {
    pub amount: u64,
    /// millisecond precision on the wire
    pub expires_at: SystemTime,
    pub execution_condition: [u8; 32],
    pub destination: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IlpFulfill {
    pub fulfillment: [u8; 32],
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IlpReject {
    pub code: [u8; 3],
    pub triggered_by: String,
    pub message: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IlpReply {
    Fulfill(IlpFulfill),
    Reject(IlpReject),
}

impl IlpPrepare {
    pub fn ser(&self, buf: &mut BytesMut) {
        let mut contents = BytesMut::new();
        contents.put_u64(self.amount);
        contents.put_slice(&ser_timestamp(self.expires_at));
        contents.put_slice(&self.execution_condition);
        put_var_octets(&mut contents, self.destination.as_bytes());
        put_var_octets(&mut contents, &self.data);

        put_envelope(buf, IlpPacketType::Prepare, &contents);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<IlpPrepare> {
        let mut contents = try_get_envelope(buf, IlpPacketType::Prepare)?;

        let amount = try_get_u64(&mut contents)?;
        let expires_at = deser_timestamp(&try_get_fixed::<TIMESTAMP_LEN>(&mut contents)?)?;
        let execution_condition = try_get_fixed(&mut contents)?;
        let destination = try_get_var_string(&mut contents)?;
        let data = try_get_var_octets(&mut contents)?;
        ensure_consumed(&contents)?;

        Ok(IlpPrepare {
            amount,
            expires_at,
            execution_condition,
            destination,
            data,
        })
    }
}

impl IlpFulfill {
    pub fn ser(&self, buf: &mut BytesMut) {
        let mut contents = BytesMut::new();
        contents.put_slice(&self.fulfillment);
        put_var_octets(&mut contents, &self.data);

        put_envelope(buf, IlpPacketType::Fulfill, &contents);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<IlpFulfill> {
        let mut contents = try_get_envelope(buf, IlpPacketType::Fulfill)?;

        let fulfillment = try_get_fixed(&mut contents)?;
        let data = try_get_var_octets(&mut contents)?;
        ensure_consumed(&contents)?;

        Ok(IlpFulfill { fulfillment, data })
    }
}

impl IlpReject {
    pub fn ser(&self, buf: &mut BytesMut) {
        let mut contents = BytesMut::new();
        contents.put_slice(&self.code);
        put_var_octets(&mut contents, self.triggered_by.as_bytes());
        put_var_octets(&mut contents, self.message.as_bytes());
        put_var_octets(&mut contents, &self.data);

        put_envelope(buf, IlpPacketType::Reject, &contents);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<IlpReject> {
        let mut contents = try_get_envelope(buf, IlpPacketType::Reject)?;

        let code = try_get_fixed(&mut contents)?;
        let triggered_by = try_get_var_string(&mut contents)?;
        let message = try_get_var_string(&mut contents)?;
        let data = try_get_var_octets(&mut contents)?;
        ensure_consumed(&contents)?;

        Ok(IlpReject {
            code,
            triggered_by,
            message,
            data,
        })
    }
}

impl IlpReply {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            IlpReply::Fulfill(fulfill) => fulfill.ser(buf),
            IlpReply::Reject(reject) => reject.ser(buf),
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<IlpReply> {
        match peek_packet_type(buf.chunk())? {
            IlpPacketType::Fulfill => Ok(IlpReply::Fulfill(IlpFulfill::deser(buf)?)),
            IlpPacketType::Reject => Ok(IlpReply::Reject(IlpReject::deser(buf)?)),
            IlpPacketType::Prepare => bail!("expected a fulfill or reject, found a prepare"),
        }
    }
}


fn peek_packet_type(buf: &[u8]) -> anyhow::Result<IlpPacketType> {
    let Some(&type_byte) = buf.first() else {
        bail!("empty ILP packet");
    };
    Ok(IlpPacketType::try_from_primitive(type_byte)?)
}

fn put_envelope(buf: &mut BytesMut, packet_type: IlpPacketType, contents: &[u8]) {
    buf.reserve(1 + serialized_len(contents.len()) + contents.len());
    buf.put_u8(packet_type.into());
    put_var_octets(buf, contents);
}

fn try_get_envelope(buf: &mut impl Buf, expected: IlpPacketType) -> anyhow::Result<Bytes> {
    let actual = peek_packet_type(buf.chunk())?;
    if actual != expected {
        bail!("expected ILP packet type {:?}, found {:?}", expected, actual);
    }
    buf.advance(1);
    try_get_var_octets(buf)
}

fn ensure_consumed(contents: &impl Buf) -> anyhow::Result<()> {
    if contents.has_remaining() {
        bail!("{} unexpected trailing bytes in ILP packet", contents.remaining());
    }
    Ok(())
}

fn put_var_octets(buf: &mut BytesMut, data: &[u8]) {
    put_length_prefix(buf, data.len());
    buf.put_slice(data);
}

fn try_get_var_octets(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = try_get_length_prefix(buf)?;
    if buf.remaining() < len {
        bail!("buffer underflow: expected {} bytes, {} remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

fn try_get_var_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_var_octets(buf)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

fn try_get_fixed<const N: usize>(buf: &mut impl Buf) -> anyhow::Result<[u8; N]> {
    if buf.remaining() < N {
        bail!("buffer underflow: expected {} bytes, {} remaining", N, buf.remaining());
    }
    let mut result = [0u8; N];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

fn try_get_u64(buf: &mut impl Buf) -> anyhow::Result<u64> {
    Ok(u64::from_be_bytes(try_get_fixed(buf)?))
}


const TIMESTAMP_LEN: usize = 17;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

fn ser_timestamp(t: SystemTime) -> [u8; TIMESTAMP_LEN] {
    //TODO represent times outside 1970..=9999 explicitly instead of clamping
    let millis = t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
        .min(253402300799999);

    let (year, month, day) = civil_from_days((millis / MILLIS_PER_DAY) as i64);
    let millis_of_day = millis % MILLIS_PER_DAY;

    let formatted = format!("{:04}{:02}{:02}{:02}{:02}{:02}{:03}",
        year, month, day,
        millis_of_day / 3_600_000,
        millis_of_day / 60_000 % 60,
        millis_of_day / 1000 % 60,
        millis_of_day % 1000,
    );

    let mut result = [0u8; TIMESTAMP_LEN];
    result.copy_from_slice(formatted.as_bytes());
    result
}

fn deser_timestamp(raw: &[u8; TIMESTAMP_LEN]) -> anyhow::Result<SystemTime> {
    fn digits(raw: &[u8]) -> anyhow::Result<u64> {
        raw.iter().try_fold(0u64, |acc, &b| {
            if !b.is_ascii_digit() {
                bail!("invalid character {:?} in timestamp", b as char);
            }
            Ok(acc * 10 + (b - b'0') as u64)
        })
    }

    let year = digits(&raw[0..4])?;
    let month = digits(&raw[4..6])?;
    let day = digits(&raw[6..8])?;
    let hour = digits(&raw[8..10])?;
    let minute = digits(&raw[10..12])?;
    let second = digits(&raw[12..14])?;
    let millis = digits(&raw[14..17])?;

    if year < 1970 || !(1..=12).contains(&month) || hour > 23 || minute > 59 || second > 59 {
        bail!("timestamp out of range: {}", String::from_utf8_lossy(raw));
    }
    if day == 0 || day > days_in_month(year, month) {
        bail!("timestamp out of range: {}", String::from_utf8_lossy(raw));
    }

    let days = days_from_civil(year as i64, month as u32, day as u32) as u64;
    let total_millis = days * MILLIS_PER_DAY + ((hour * 60 + minute) * 60 + second) * 1000 + millis;
    Ok(UNIX_EPOCH + Duration::from_millis(total_millis))
}

fn days_in_month(year: u64, month: u64) -> u64 {
    match month {
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// days since 1970-01-01 for a date in the proleptic Gregorian calendar
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let year_of_era = year - era * 400;
    let month_index = (month as i64 + 9) % 12;
    let day_of_year = (153 * month_index + 2) / 5 + day as i64 - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    era * 146097 + day_of_era - 719468
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let days = days + 719468;
    let era = days.div_euclid(146097);
    let day_of_era = days - era * 146097;
    let year_of_era = (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * month_index + 2) / 5 + 1) as u32;
    let month = if month_index < 10 { month_index + 3 } else { month_index - 9 };
    let year = year_of_era + era * 400;
    if month <= 2 {
        (year + 1, month as u32, day)
    }
    else {
        (year, month as u32, day)
    }
}


/// [PacketCodec] for ILP: Prepares are requests, Fulfills and Rejects are replies
#[derive(Debug, Clone, Copy, Default)]
pub struct IlpCodec;

impl PacketCodec for IlpCodec {
    type Request = IlpPrepare;
    type Reply = IlpReply;

    fn classify(&self, payload: &[u8]) -> Option<PayloadKind> {
        match peek_packet_type(payload).ok()? {
            IlpPacketType::Prepare => Some(PayloadKind::Request),
            IlpPacketType::Fulfill | IlpPacketType::Reject => Some(PayloadKind::Reply),
        }
    }

    fn encode_request(&self, request: &IlpPrepare) -> Bytes {
        let mut buf = BytesMut::new();
        request.ser(&mut buf);
        buf.freeze()
    }

    fn decode_request(&self, mut payload: &[u8]) -> anyhow::Result<IlpPrepare> {
        let prepare = IlpPrepare::deser(&mut payload)?;
        ensure_consumed(&payload)?;
        Ok(prepare)
    }

    fn encode_reply(&self, reply: &IlpReply) -> Bytes {
        let mut buf = BytesMut::new();
        reply.ser(&mut buf);
        buf.freeze()
    }

    fn decode_reply(&self, mut payload: &[u8]) -> anyhow::Result<IlpReply> {
        let reply = IlpReply::deser(&mut payload)?;
        ensure_consumed(&payload)?;
        Ok(reply)
    }

    fn destination<'a>(&self, request: &'a IlpPrepare) -> &'a str {
        &request.destination
    }

    fn expires_at(&self, request: &IlpPrepare) -> SystemTime {
        request.expires_at
    }

    fn reject(&self, rejection: Rejection) -> IlpReply {
        IlpReply::Reject(IlpReject {
            code: rejection.code,
            triggered_by: rejection.triggered_by,
            message: rejection.message,
            data: rejection.data,
        })
    }
}
