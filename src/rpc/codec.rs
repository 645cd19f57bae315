//! Wire codec for peer-to-peer RPC.
//!
//! A message is a MessagePack 3-tuple `(op_code, fun_code, body)`
//! compressed with zlib for transit. The two domain records ride as
//! MessagePack extension values: tag 1 is a search result packed as a
//! 6-tuple, tag 2 a peer packed as a 4-tuple. There is no length
//! prefix; a peer closes its half of the connection once its single
//! message is sent, and the receiver reads in fixed-size chunks until
//! a short read or EOF.

use std::collections::HashSet;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rmpv::Value;

use crate::rpc::error::RpcError;
use crate::types::{PeerInfo, ProxyType, ResultHash, SearchResult};

/// Request for a remote call.
pub const OP_CALL: u64 = 1;
/// Successful response carrying the method return.
pub const OP_RETURN: u64 = 2;
/// Failure response carrying an error string.
pub const OP_ERROR: u64 = 3;

/// MessagePack extension tag for [`SearchResult`].
pub const RESULT_EXT_TAG: i8 = 1;
/// MessagePack extension tag for [`PeerInfo`].
pub const PEER_EXT_TAG: i8 = 2;

/// Receive chunk size; a read shorter than this ends the message.
pub const RECV_CHUNK_LEN: usize = 2 * 1024;

fn framing_err(message: impl Into<String>) -> RpcError {
    RpcError::protocol(0, message)
}

/// Encode and compress one message.
pub fn encode_message(op_code: u64, fun_code: u64, body: Value) -> Result<Vec<u8>, RpcError> {
    let envelope = Value::Array(vec![Value::from(op_code), Value::from(fun_code), body]);

    let mut packed = Vec::new();
    rmpv::encode::write_value(&mut packed, &envelope)
        .map_err(|e| framing_err(format!("Failed to encode envelope: {e}")))?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&packed)
        .map_err(|e| framing_err(format!("Failed to compress message: {e}")))?;
    encoder
        .finish()
        .map_err(|e| framing_err(format!("Failed to finish compression: {e}")))
}

/// Decompress and decode one message into `(op_code, fun_code, body)`.
pub fn decode_message(raw: &[u8]) -> Result<(u64, u64, Value), RpcError> {
    let mut packed = Vec::new();
    ZlibDecoder::new(raw)
        .read_to_end(&mut packed)
        .map_err(|e| framing_err(format!("Failed to decompress message: {e}")))?;

    let mut slice: &[u8] = &packed;
    let envelope = rmpv::decode::read_value(&mut slice)
        .map_err(|e| framing_err(format!("Failed to decode envelope: {e}")))?;

    let mut fields = match envelope {
        Value::Array(fields) if fields.len() == 3 => fields,
        _ => return Err(framing_err("Envelope is not a 3-element sequence")),
    };
    let body = fields
        .pop()
        .ok_or_else(|| framing_err("Envelope is missing its body"))?;
    let fun_code = fields
        .pop()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| framing_err("Envelope function code is not an integer"))?;
    let op_code = fields
        .pop()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| framing_err("Envelope op code is not an integer"))?;
    Ok((op_code, fun_code, body))
}

fn pack(value: &Value) -> Result<Vec<u8>, RpcError> {
    let mut packed = Vec::new();
    rmpv::encode::write_value(&mut packed, value)
        .map_err(|e| framing_err(format!("Failed to pack extension payload: {e}")))?;
    Ok(packed)
}

fn unpack(data: &[u8]) -> Result<Value, RpcError> {
    let mut slice = data;
    rmpv::decode::read_value(&mut slice)
        .map_err(|e| framing_err(format!("Failed to unpack extension payload: {e}")))
}

/// A search result as the ext-1 value carrying the 6-tuple
/// `(hash, title, url, description, content_type, score)`.
pub fn result_to_value(result: &SearchResult) -> Result<Value, RpcError> {
    let inner = Value::Array(vec![
        Value::Binary(result.hash.to_vec()),
        Value::from(result.title.as_str()),
        Value::from(result.url.as_str()),
        Value::from(result.description.as_str()),
        Value::from(result.content_type.as_str()),
        Value::from(result.score),
    ]);
    Ok(Value::Ext(RESULT_EXT_TAG, pack(&inner)?))
}

pub fn value_to_result(value: &Value) -> Result<SearchResult, RpcError> {
    let data = match value {
        Value::Ext(tag, data) if *tag == RESULT_EXT_TAG => data,
        Value::Ext(tag, _) => {
            return Err(framing_err(format!(
                "Expected search result (ext {RESULT_EXT_TAG}), got ext {tag}"
            )))
        }
        _ => return Err(framing_err("Expected a search result extension value")),
    };

    let fields = match unpack(data)? {
        Value::Array(fields) if fields.len() == 6 => fields,
        _ => return Err(framing_err("Search result is not a 6-tuple")),
    };

    let hash: ResultHash = match &fields[0] {
        Value::Binary(bytes) => bytes
            .clone()
            .try_into()
            .map_err(|_| framing_err("Search result hash is not 32 bytes"))?,
        _ => return Err(framing_err("Search result hash is not a byte string")),
    };
    let title = field_str(&fields[1], "title")?;
    let url = field_str(&fields[2], "url")?;
    let description = field_str(&fields[3], "description")?;
    let content_type = field_str(&fields[4], "content_type")?;
    let score = fields[5]
        .as_i64()
        .ok_or_else(|| framing_err("Search result score is not an integer"))?;

    Ok(SearchResult::from_parts(
        hash,
        title,
        url,
        description,
        content_type,
        score,
    ))
}

/// A peer as the ext-2 value carrying the 4-tuple
/// `(address, rank, proxy_type, proxy_address)`.
pub fn peer_to_value(peer: &PeerInfo) -> Result<Value, RpcError> {
    let inner = Value::Array(vec![
        Value::from(peer.address.as_str()),
        Value::from(peer.rank),
        Value::from(peer.proxy_type.wire_code()),
        Value::from(peer.proxy_address.as_str()),
    ]);
    Ok(Value::Ext(PEER_EXT_TAG, pack(&inner)?))
}

pub fn value_to_peer(value: &Value) -> Result<PeerInfo, RpcError> {
    let data = match value {
        Value::Ext(tag, data) if *tag == PEER_EXT_TAG => data,
        Value::Ext(tag, _) => {
            return Err(framing_err(format!(
                "Expected peer (ext {PEER_EXT_TAG}), got ext {tag}"
            )))
        }
        _ => return Err(framing_err("Expected a peer extension value")),
    };

    let fields = match unpack(data)? {
        Value::Array(fields) if fields.len() == 4 => fields,
        _ => return Err(framing_err("Peer is not a 4-tuple")),
    };

    let address = field_str(&fields[0], "address")?;
    let rank = fields[1]
        .as_i64()
        .ok_or_else(|| framing_err("Peer rank is not an integer"))?;
    let proxy_code = fields[2]
        .as_i64()
        .ok_or_else(|| framing_err("Peer proxy type is not an integer"))?;
    let proxy_type = ProxyType::from_wire_code(proxy_code)
        .ok_or_else(|| framing_err(format!("Unknown peer proxy type code {proxy_code}")))?;
    let proxy_address = field_str(&fields[3], "proxy_address")?;

    Ok(PeerInfo {
        address,
        rank,
        proxy_type,
        proxy_address,
    })
}

fn field_str(value: &Value, name: &str) -> Result<String, RpcError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| framing_err(format!("Field '{name}' is not a string")))
}

pub fn results_to_value(results: &[SearchResult]) -> Result<Value, RpcError> {
    let values = results
        .iter()
        .map(result_to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(values))
}

pub fn value_to_results(value: &Value) -> Result<Vec<SearchResult>, RpcError> {
    match value {
        Value::Array(values) => values.iter().map(value_to_result).collect(),
        _ => Err(framing_err("Expected a sequence of search results")),
    }
}

pub fn peers_to_value(peers: &[PeerInfo]) -> Result<Value, RpcError> {
    let values = peers
        .iter()
        .map(peer_to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(values))
}

pub fn value_to_peers(value: &Value) -> Result<Vec<PeerInfo>, RpcError> {
    match value {
        Value::Array(values) => values.iter().map(value_to_peer).collect(),
        _ => Err(framing_err("Expected a sequence of peers")),
    }
}

pub fn hashes_to_value(hashes: &HashSet<ResultHash>) -> Value {
    Value::Array(
        hashes
            .iter()
            .map(|h| Value::Binary(h.to_vec()))
            .collect(),
    )
}

pub fn value_to_hashes(value: &Value) -> Result<HashSet<ResultHash>, RpcError> {
    let values = match value {
        Value::Array(values) => values,
        _ => return Err(framing_err("Expected a sequence of hashes")),
    };
    let mut hashes = HashSet::with_capacity(values.len());
    for value in values {
        match value {
            Value::Binary(bytes) => {
                let hash: ResultHash = bytes
                    .clone()
                    .try_into()
                    .map_err(|_| framing_err("Hash is not 32 bytes"))?;
                hashes.insert(hash);
            }
            _ => return Err(framing_err("Hash is not a byte string")),
        }
    }
    Ok(hashes)
}

/// Read one close-on-complete framed message: fixed-size chunks until
/// a short read or EOF.
pub fn read_framed<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; RECV_CHUNK_LEN];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if n < RECV_CHUNK_LEN {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_round_trip() {
        let result = SearchResult::new("Title", "http://www.google.com/", "desc");
        let value = result_to_value(&result).unwrap();
        assert_eq!(value_to_result(&value).unwrap(), result);
    }

    #[test]
    fn test_peer_round_trip() {
        let peer =
            PeerInfo::with_proxy("tcp://10.0.0.1:4222", ProxyType::Socks5, "tcp://proxy:9050");
        let value = peer_to_value(&peer).unwrap();
        let decoded = value_to_peer(&value).unwrap();
        assert_eq!(decoded, peer);
    }

    #[test]
    fn test_message_round_trip_through_compression() {
        let results = vec![
            SearchResult::new("one", "http://one/", "first"),
            SearchResult::new("two", "http://two/", "second"),
        ];
        let body = results_to_value(&results).unwrap();
        let raw = encode_message(OP_RETURN, 101, body).unwrap();

        let (op, fun, decoded_body) = decode_message(&raw).unwrap();
        assert_eq!(op, OP_RETURN);
        assert_eq!(fun, 101);
        assert_eq!(value_to_results(&decoded_body).unwrap(), results);
    }

    #[test]
    fn test_hashes_round_trip() {
        let mut hashes = HashSet::new();
        hashes.insert([1u8; 32]);
        hashes.insert([2u8; 32]);
        let value = hashes_to_value(&hashes);
        assert_eq!(value_to_hashes(&value).unwrap(), hashes);
    }

    #[test]
    fn test_ext_tag_mismatch_is_rejected() {
        let peer = PeerInfo::new("tcp://a:1");
        let value = peer_to_value(&peer).unwrap();
        assert!(value_to_result(&value).is_err());
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        let err = decode_message(b"definitely not zlib").unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }

    #[test]
    fn test_decode_rejects_short_envelope() {
        let raw = encode_message(OP_CALL, 0, Value::Nil).unwrap();
        // valid message decodes fine
        assert!(decode_message(&raw).is_ok());

        let mut packed = Vec::new();
        rmpv::encode::write_value(&mut packed, &Value::Array(vec![Value::from(1u64)])).unwrap();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&packed).unwrap();
        let compressed = encoder.finish().unwrap();
        assert!(decode_message(&compressed).is_err());
    }

    #[test]
    fn test_read_framed_stops_on_short_read() {
        let data = vec![7u8; 100];
        let mut cursor = std::io::Cursor::new(data.clone());
        assert_eq!(read_framed(&mut cursor).unwrap(), data);
    }
}
