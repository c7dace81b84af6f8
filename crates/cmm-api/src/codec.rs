//! Binary frame codec.
//!
//! Layout: a fixed header `{sender: u8, dest: u8, type: u8}` followed by the
//! type-specific payload. Multi-byte fields use one fixed little-endian
//! layout (homogeneous-node assumption). GET_MEMBER_INFO carries a
//! count-prefixed member array with length-prefixed strings.
//!
//! Stream errors are connection-level and never retried here: the transport
//! layer above tears the hop down and re-establishes it.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cmm_common::{CmmError, Result};

use crate::frame::{Dest, Frame, Payload};
use crate::model::{ChangeKind, Member, MemberFlags, Office, QualifState, QueryKind};

/// Encode a frame into `buf`.
pub fn encode(frame: &Frame, buf: &mut BytesMut) {
    buf.put_u8(frame.sender);
    buf.put_u8(frame.dest.as_wire());
    buf.put_u8(frame.payload.tag());

    match &frame.payload {
        Payload::Register { answer } => buf.put_u8(*answer),
        Payload::Disconnect | Payload::Heartbeat => {}
        Payload::NodeChange { left, node } => {
            buf.put_u8(*left as u8);
            buf.put_u8(*node);
        }
        Payload::Election {
            office,
            request,
            elected,
        } => {
            buf.put_u8(office.as_wire());
            buf.put_u8(*request as u8);
            buf.put_u8(*elected);
        }
        Payload::Notification { kind, node } => {
            buf.put_u8(kind.as_wire());
            buf.put_u8(*node);
        }
        Payload::GetMemberInfo {
            query,
            target,
            members,
        } => {
            buf.put_u8(query.as_wire());
            buf.put_u8(*target);
            buf.put_u16_le(members.len() as u16);
            for member in members {
                put_member(buf, member);
            }
        }
        Payload::MastershipRelease { result } => buf.put_u8(*result),
        Payload::QualifChange {
            node,
            state,
            request,
            result,
        } => {
            buf.put_u8(*node);
            buf.put_u8(state.as_wire());
            buf.put_u8(*request as u8);
            buf.put_u8(*result);
        }
    }
}

/// Decode one frame from `buf`.
pub fn decode(buf: &mut impl Buf) -> Result<Frame> {
    need(buf, 3)?;
    let sender = buf.get_u8();
    let dest = Dest::from_wire(buf.get_u8());
    let tag = buf.get_u8();

    let payload = match tag {
        Payload::REGISTER => {
            need(buf, 1)?;
            Payload::Register {
                answer: buf.get_u8(),
            }
        }
        Payload::DISCONNECT => Payload::Disconnect,
        Payload::HEARTBEAT => Payload::Heartbeat,
        Payload::NODE_CHANGE => {
            need(buf, 2)?;
            Payload::NodeChange {
                left: buf.get_u8() != 0,
                node: buf.get_u8(),
            }
        }
        Payload::ELECTION => {
            need(buf, 3)?;
            Payload::Election {
                office: Office::from_wire(buf.get_u8())?,
                request: buf.get_u8() != 0,
                elected: buf.get_u8(),
            }
        }
        Payload::NOTIFICATION => {
            need(buf, 2)?;
            Payload::Notification {
                kind: ChangeKind::from_wire(buf.get_u8())?,
                node: buf.get_u8(),
            }
        }
        Payload::GET_MEMBER_INFO => {
            need(buf, 4)?;
            let query = QueryKind::from_wire(buf.get_u8())?;
            let target = buf.get_u8();
            let count = buf.get_u16_le() as usize;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                members.push(get_member(buf)?);
            }
            Payload::GetMemberInfo {
                query,
                target,
                members,
            }
        }
        Payload::MASTERSHIP_RELEASE => {
            need(buf, 1)?;
            Payload::MastershipRelease {
                result: buf.get_u8(),
            }
        }
        Payload::QUALIF_CHANGE => {
            need(buf, 4)?;
            Payload::QualifChange {
                node: buf.get_u8(),
                state: QualifState::from_wire(buf.get_u8())?,
                request: buf.get_u8() != 0,
                result: buf.get_u8(),
            }
        }
        other => {
            return Err(CmmError::Protocol(format!("unknown frame type {other:#04x}")));
        }
    };

    Ok(Frame {
        sender,
        dest,
        payload,
    })
}

/// Write a frame to a stream. Any I/O failure (including a detected hangup)
/// is a connection error.
pub async fn send_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(64);
    encode(frame, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from a stream, optionally bounded by `timeout` (the
/// heartbeat timeout on ring hops). Timeout, EOF and truncation all report
/// as connection errors.
pub async fn recv_frame<R>(reader: &mut R, timeout: Option<Duration>) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    match timeout {
        Some(bound) => tokio::time::timeout(bound, recv_frame_inner(reader))
            .await
            .map_err(|_| CmmError::Connection("frame read timed out".to_string()))?,
        None => recv_frame_inner(reader).await,
    }
}

async fn recv_frame_inner<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 3];
    reader.read_exact(&mut header).await?;
    let sender = header[0];
    let dest = Dest::from_wire(header[1]);
    let tag = header[2];

    // Fixed-size payloads are read in one piece and decoded with the
    // in-memory path; the member array is read incrementally because its
    // strings are length-prefixed.
    let payload = match tag {
        Payload::DISCONNECT => Payload::Disconnect,
        Payload::HEARTBEAT => Payload::Heartbeat,
        Payload::REGISTER | Payload::MASTERSHIP_RELEASE => {
            let b = read_bytes::<1, _>(reader).await?;
            match tag {
                Payload::REGISTER => Payload::Register { answer: b[0] },
                _ => Payload::MastershipRelease { result: b[0] },
            }
        }
        Payload::NODE_CHANGE => {
            let b = read_bytes::<2, _>(reader).await?;
            Payload::NodeChange {
                left: b[0] != 0,
                node: b[1],
            }
        }
        Payload::ELECTION => {
            let b = read_bytes::<3, _>(reader).await?;
            Payload::Election {
                office: Office::from_wire(b[0])?,
                request: b[1] != 0,
                elected: b[2],
            }
        }
        Payload::NOTIFICATION => {
            let b = read_bytes::<2, _>(reader).await?;
            Payload::Notification {
                kind: ChangeKind::from_wire(b[0])?,
                node: b[1],
            }
        }
        Payload::GET_MEMBER_INFO => {
            let b = read_bytes::<4, _>(reader).await?;
            let query = QueryKind::from_wire(b[0])?;
            let target = b[1];
            let count = u16::from_le_bytes([b[2], b[3]]) as usize;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                members.push(read_member(reader).await?);
            }
            Payload::GetMemberInfo {
                query,
                target,
                members,
            }
        }
        Payload::QUALIF_CHANGE => {
            let b = read_bytes::<4, _>(reader).await?;
            Payload::QualifChange {
                node: b[0],
                state: QualifState::from_wire(b[1])?,
                request: b[2] != 0,
                result: b[3],
            }
        }
        other => {
            return Err(CmmError::Protocol(format!("unknown frame type {other:#04x}")));
        }
    };

    Ok(Frame {
        sender,
        dest,
        payload,
    })
}

fn put_member(buf: &mut BytesMut, member: &Member) {
    // Name and address are capped at 255 bytes by config validation.
    let addr = member.addr.to_string();
    buf.put_u8(member.id);
    buf.put_u8(member.name.len() as u8);
    buf.put_slice(member.name.as_bytes());
    buf.put_u8(addr.len() as u8);
    buf.put_slice(addr.as_bytes());
    buf.put_u8(member.domain);
    buf.put_u32_le(member.flags.bits());
    buf.put_u32_le(member.incarnation);
    buf.put_u32_le(member.load_id);
}

fn get_member(buf: &mut impl Buf) -> Result<Member> {
    need(buf, 2)?;
    let id = buf.get_u8();
    let name_len = buf.get_u8() as usize;
    need(buf, name_len)?;
    let name = take_string(buf, name_len)?;
    need(buf, 1)?;
    let addr_len = buf.get_u8() as usize;
    need(buf, addr_len)?;
    let addr = take_string(buf, addr_len)?;
    need(buf, 13)?;
    let domain = buf.get_u8();
    let flags = MemberFlags::from_bits(buf.get_u32_le());
    let incarnation = buf.get_u32_le();
    let load_id = buf.get_u32_le();
    build_member(id, name, addr, domain, flags, incarnation, load_id)
}

async fn read_member<R>(reader: &mut R) -> Result<Member>
where
    R: AsyncRead + Unpin,
{
    let head = read_bytes::<2, _>(reader).await?;
    let id = head[0];
    let mut name = vec![0u8; head[1] as usize];
    reader.read_exact(&mut name).await?;
    let addr_len = read_bytes::<1, _>(reader).await?[0] as usize;
    let mut addr = vec![0u8; addr_len];
    reader.read_exact(&mut addr).await?;
    let tail = read_bytes::<13, _>(reader).await?;
    let name = String::from_utf8(name)
        .map_err(|_| CmmError::Protocol("member name is not valid UTF-8".to_string()))?;
    let addr = String::from_utf8(addr)
        .map_err(|_| CmmError::Protocol("member address is not valid UTF-8".to_string()))?;
    let flags = MemberFlags::from_bits(u32::from_le_bytes([tail[1], tail[2], tail[3], tail[4]]));
    let incarnation = u32::from_le_bytes([tail[5], tail[6], tail[7], tail[8]]);
    let load_id = u32::from_le_bytes([tail[9], tail[10], tail[11], tail[12]]);
    build_member(id, name, addr, tail[0], flags, incarnation, load_id)
}

fn build_member(
    id: u8,
    name: String,
    addr: String,
    domain: u8,
    flags: MemberFlags,
    incarnation: u32,
    load_id: u32,
) -> Result<Member> {
    let addr = addr
        .parse()
        .map_err(|_| CmmError::Protocol(format!("invalid member address '{addr}'")))?;
    Ok(Member {
        id,
        name,
        addr,
        domain,
        flags,
        incarnation,
        load_id,
    })
}

fn take_string(buf: &mut impl Buf, len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes)
        .map_err(|_| CmmError::Protocol("string field is not valid UTF-8".to_string()))
}

async fn read_bytes<const N: usize, R>(reader: &mut R) -> Result<[u8; N]>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

fn need(buf: &impl Buf, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(CmmError::Protocol(format!(
            "truncated frame: need {n} more bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}
