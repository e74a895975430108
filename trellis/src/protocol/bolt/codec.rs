use super::*;
use crate::buffer::IoBuffer;
use bytes::{BufMut, Bytes, BytesMut};
use trellis_common::error::TrellisError;
use trellis_common::TrellisResult;

/// Incremental BoltRPC frame codec. `decode` returns `Ok(None)` without
/// consuming the buffer while a full frame has not arrived; frame-level
/// violations are `TrellisError::Codec` (connection-fatal), payload
/// deserialization failures are `TrellisError::Deserialize` and consume the
/// offending frame.
pub struct BoltCodec;

impl BoltCodec {
    pub fn decode(buf: &mut IoBuffer) -> TrellisResult<Option<BoltCommand>> {
        let data = buf.bytes();
        if data.len() < 2 {
            return Ok(None);
        }
        if data[0] != PROTOCOL_CODE_V1 {
            return Err(TrellisError::Codec(format!(
                "unknown protocol code {:#04x}",
                data[0]
            )));
        }
        let cmd_type = data[1];
        let fixed_len = match cmd_type {
            CMD_TYPE_RESPONSE => RESPONSE_HEADER_LEN,
            CMD_TYPE_REQUEST | CMD_TYPE_REQUEST_ONEWAY => REQUEST_HEADER_LEN,
            _ => {
                return Err(TrellisError::Codec(format!(
                    "unknown cmd type {}",
                    cmd_type
                )))
            }
        };
        if data.len() < fixed_len {
            return Ok(None);
        }

        let cmd_code = u16::from_be_bytes([data[2], data[3]]);
        if cmd_code > CMD_CODE_RPC_RESPONSE {
            return Err(TrellisError::Codec(format!(
                "unknown cmd code {}",
                cmd_code
            )));
        }
        let version = data[4];
        let request_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let codec = data[9];

        let (timeout, status, var_at) = if cmd_type == CMD_TYPE_RESPONSE {
            (0, u16::from_be_bytes([data[10], data[11]]), 12)
        } else {
            (
                i32::from_be_bytes([data[10], data[11], data[12], data[13]]),
                0,
                14,
            )
        };
        let class_len = u16::from_be_bytes([data[var_at], data[var_at + 1]]) as usize;
        let header_len = u16::from_be_bytes([data[var_at + 2], data[var_at + 3]]) as usize;
        let content_len = u32::from_be_bytes([
            data[var_at + 4],
            data[var_at + 5],
            data[var_at + 6],
            data[var_at + 7],
        ]) as usize;

        let total = fixed_len + class_len + header_len + content_len;
        if data.len() < total {
            return Ok(None);
        }

        // Whole frame present, consume it before payload validation so a
        // bad payload never wedges the framing.
        let frame = buf.drain_to(total);
        let class_at = fixed_len;
        let header_at = class_at + class_len;
        let content_at = header_at + header_len;

        if header_len > 0 && codec != HESSIAN2_SERIALIZE {
            return Err(TrellisError::Deserialize {
                request_id,
                msg: format!("unsupported serializer id {}", codec),
            });
        }
        let class_name = std::str::from_utf8(&frame[class_at..header_at])
            .map_err(|e| TrellisError::Deserialize {
                request_id,
                msg: format!("class name: {}", e),
            })?
            .to_owned();
        let headers = decode_map(&frame[header_at..content_at]).map_err(|msg| {
            TrellisError::Deserialize { request_id, msg }
        })?;
        let content = frame.slice(content_at..total);

        Ok(Some(BoltCommand {
            protocol_code: PROTOCOL_CODE_V1,
            cmd_type,
            cmd_code,
            version,
            request_id,
            codec,
            timeout,
            status,
            class_name,
            headers,
            content,
        }))
    }

    pub fn encode(cmd: &BoltCommand) -> IoBuffer {
        let header_bytes = encode_map(&cmd.headers);
        let class_bytes = cmd.class_name.as_bytes();
        let fixed_len = if cmd.cmd_type == CMD_TYPE_RESPONSE {
            RESPONSE_HEADER_LEN
        } else {
            REQUEST_HEADER_LEN
        };
        let mut out = BytesMut::with_capacity(
            fixed_len + class_bytes.len() + header_bytes.len() + cmd.content.len(),
        );
        out.put_u8(cmd.protocol_code);
        out.put_u8(cmd.cmd_type);
        out.put_u16(cmd.cmd_code);
        out.put_u8(cmd.version);
        out.put_u32(cmd.request_id);
        out.put_u8(cmd.codec);
        if cmd.cmd_type == CMD_TYPE_RESPONSE {
            out.put_u16(cmd.status);
        } else {
            out.put_i32(cmd.timeout);
        }
        out.put_u16(class_bytes.len() as u16);
        out.put_u16(header_bytes.len() as u16);
        out.put_u32(cmd.content.len() as u32);
        out.put_slice(class_bytes);
        out.put_slice(&header_bytes);
        out.put_slice(&cmd.content);
        IoBuffer::from_bytes(&out)
    }
}
