mod codec;
mod hessian;

pub use codec::BoltCodec;
pub use hessian::{decode_map, encode_map};

use super::ProbeResult;
use bytes::Bytes;
use trellis_common::headers::HeaderBag;

pub const PROTOCOL_CODE_V1: u8 = 1;
pub const PROTOCOL_VERSION_1: u8 = 1;

/// Fixed header sizes including the protocol and type bytes.
pub const REQUEST_HEADER_LEN: usize = 22;
pub const RESPONSE_HEADER_LEN: usize = 20;

pub const CMD_TYPE_RESPONSE: u8 = 0;
pub const CMD_TYPE_REQUEST: u8 = 1;
pub const CMD_TYPE_REQUEST_ONEWAY: u8 = 2;

pub const CMD_CODE_HEARTBEAT: u16 = 0;
pub const CMD_CODE_RPC_REQUEST: u16 = 1;
pub const CMD_CODE_RPC_RESPONSE: u16 = 2;

pub const HESSIAN2_SERIALIZE: u8 = 1;

/// A timeout of -1 on a request means "no deadline", the route default
/// applies.
pub const REQUEST_TIMEOUT_NONE: i32 = -1;

pub const STATUS_SUCCESS: u16 = 0x0000;
pub const STATUS_ERROR: u16 = 0x0001;
pub const STATUS_SERVER_EXCEPTION: u16 = 0x0002;
pub const STATUS_UNKNOWN: u16 = 0x0003;
pub const STATUS_SERVER_THREADPOOL_BUSY: u16 = 0x0004;
pub const STATUS_ERROR_COMM: u16 = 0x0005;
pub const STATUS_NO_PROCESSOR: u16 = 0x0006;
pub const STATUS_TIMEOUT: u16 = 0x0007;
pub const STATUS_CLIENT_SEND_ERROR: u16 = 0x0008;
pub const STATUS_CODEC_EXCEPTION: u16 = 0x0009;

/// One decoded BoltRPC frame. Request and response share the layout except
/// for the timeout/status word; the unused one stays at its default.
#[derive(Debug, Clone, PartialEq)]
pub struct BoltCommand {
    pub protocol_code: u8,
    pub cmd_type: u8,
    pub cmd_code: u16,
    pub version: u8,
    pub request_id: u32,
    pub codec: u8,
    pub timeout: i32,
    pub status: u16,
    pub class_name: String,
    pub headers: HeaderBag,
    pub content: Bytes,
}

impl BoltCommand {
    pub fn new_rpc_request(request_id: u32, headers: HeaderBag, content: Bytes, timeout: i32) -> Self {
        BoltCommand {
            protocol_code: PROTOCOL_CODE_V1,
            cmd_type: CMD_TYPE_REQUEST,
            cmd_code: CMD_CODE_RPC_REQUEST,
            version: PROTOCOL_VERSION_1,
            request_id,
            codec: HESSIAN2_SERIALIZE,
            timeout,
            status: 0,
            class_name: String::new(),
            headers,
            content,
        }
    }

    pub fn new_rpc_response(request_id: u32, status: u16, headers: HeaderBag, content: Bytes) -> Self {
        BoltCommand {
            protocol_code: PROTOCOL_CODE_V1,
            cmd_type: CMD_TYPE_RESPONSE,
            cmd_code: CMD_CODE_RPC_RESPONSE,
            version: PROTOCOL_VERSION_1,
            request_id,
            codec: HESSIAN2_SERIALIZE,
            timeout: 0,
            status,
            class_name: String::new(),
            headers,
            content,
        }
    }

    pub fn new_heartbeat(request_id: u32) -> Self {
        BoltCommand {
            protocol_code: PROTOCOL_CODE_V1,
            cmd_type: CMD_TYPE_REQUEST,
            cmd_code: CMD_CODE_HEARTBEAT,
            version: PROTOCOL_VERSION_1,
            request_id,
            codec: HESSIAN2_SERIALIZE,
            timeout: REQUEST_TIMEOUT_NONE,
            status: 0,
            class_name: String::new(),
            headers: HeaderBag::new(),
            content: Bytes::new(),
        }
    }

    pub fn new_heartbeat_ack(request_id: u32) -> Self {
        BoltCommand {
            protocol_code: PROTOCOL_CODE_V1,
            cmd_type: CMD_TYPE_RESPONSE,
            cmd_code: CMD_CODE_HEARTBEAT,
            version: PROTOCOL_VERSION_1,
            request_id,
            codec: HESSIAN2_SERIALIZE,
            timeout: 0,
            status: STATUS_SUCCESS,
            class_name: String::new(),
            headers: HeaderBag::new(),
            content: Bytes::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.cmd_type == CMD_TYPE_REQUEST || self.cmd_type == CMD_TYPE_REQUEST_ONEWAY
    }

    pub fn is_oneway(&self) -> bool {
        self.cmd_type == CMD_TYPE_REQUEST_ONEWAY
    }

    pub fn is_response(&self) -> bool {
        self.cmd_type == CMD_TYPE_RESPONSE
    }

    pub fn is_heartbeat(&self) -> bool {
        self.cmd_code == CMD_CODE_HEARTBEAT
    }
}

/// Maps an HTTP-family status onto a Bolt response status, used when the
/// proxy emits a synthesized (hijacked) response on a Bolt stream.
pub fn status_from_http(status: u32) -> u16 {
    match status {
        200 => STATUS_SUCCESS,
        404 => STATUS_NO_PROCESSOR,
        503 => STATUS_SERVER_THREADPOOL_BUSY,
        504 => STATUS_TIMEOUT,
        500 => STATUS_SERVER_EXCEPTION,
        400 => STATUS_CODEC_EXCEPTION,
        _ => STATUS_UNKNOWN,
    }
}

/// Reverse mapping for carrying a Bolt response status in the unified
/// header bag.
pub fn status_to_http(status: u16) -> u32 {
    match status {
        STATUS_SUCCESS => 200,
        STATUS_NO_PROCESSOR => 404,
        STATUS_SERVER_THREADPOOL_BUSY => 503,
        STATUS_TIMEOUT => 504,
        STATUS_SERVER_EXCEPTION => 500,
        STATUS_CODEC_EXCEPTION => 400,
        _ => 502,
    }
}

/// The first byte of every Bolt frame is the protocol code.
pub fn probe(prefix: &[u8]) -> ProbeResult {
    match prefix.first() {
        None => ProbeResult::Again,
        Some(&PROTOCOL_CODE_V1) => ProbeResult::Matched,
        Some(_) => ProbeResult::Failed,
    }
}
