//! Data-plane messages: batched get/put/delete/merge/scan.

use super::prelude::*;

const REQ_GET: u8 = 1;
const REQ_PUT: u8 = 2;
const REQ_DELETE: u8 = 3;
const REQ_MERGE: u8 = 4;
const REQ_SCAN: u8 = 5;

const RESP_WRITE: u8 = 1;
const RESP_GET: u8 = 2;
const RESP_SCAN: u8 = 3;

/// Status reported when a request reaches a store that does not host
/// the key's shard; the client refreshes its ring and retries once.
pub const WRONG_SHARD: &str = "wrong shard";

#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    pub key: Bytes,
    pub partition_hash: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub key: Bytes,
    pub partition_hash: u64,
    pub value: Bytes,
    pub ttl_second: u32,
    pub op_and_data_type: u8,
    /// Writer clock; 0 lets the store stamp the entry on arrival.
    pub updated_at_ns: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub key: Bytes,
    pub partition_hash: u64,
    pub updated_at_ns: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub key: Bytes,
    pub partition_hash: u64,
    pub value: Bytes,
    pub op_and_data_type: u8,
    pub updated_at_ns: u64,
}

/// Prefix scan within one partition: the scanned keys must be
/// co-located, which callers arrange with a partition-hash override.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub prefix: Bytes,
    pub partition_hash: u64,
    /// Resume after this key; empty starts at the prefix.
    pub last_seen_key: Bytes,
    pub limit: u32,
}

/// One operation within a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get(GetRequest),
    Put(PutRequest),
    Delete(DeleteRequest),
    Merge(MergeRequest),
    Scan(ScanRequest),
}

impl Request {
    /// Hash used to route this request to its shard.
    pub fn partition_hash(&self) -> u64 {
        match self {
            Request::Get(r) => r.partition_hash,
            Request::Put(r) => r.partition_hash,
            Request::Delete(r) => r.partition_hash,
            Request::Merge(r) => r.partition_hash,
            Request::Scan(r) => r.partition_hash,
        }
    }

    fn put(&self, payload: &mut Payload) {
        match self {
            Request::Get(r) => {
                payload.put_u8(REQ_GET);
                payload.put_bytes(&r.key);
                payload.put_u64(r.partition_hash);
            }
            Request::Put(r) => {
                payload.put_u8(REQ_PUT);
                payload.put_bytes(&r.key);
                payload.put_u64(r.partition_hash);
                payload.put_bytes(&r.value);
                payload.put_u32(r.ttl_second);
                payload.put_u8(r.op_and_data_type);
                payload.put_u64(r.updated_at_ns);
            }
            Request::Delete(r) => {
                payload.put_u8(REQ_DELETE);
                payload.put_bytes(&r.key);
                payload.put_u64(r.partition_hash);
                payload.put_u64(r.updated_at_ns);
            }
            Request::Merge(r) => {
                payload.put_u8(REQ_MERGE);
                payload.put_bytes(&r.key);
                payload.put_u64(r.partition_hash);
                payload.put_bytes(&r.value);
                payload.put_u8(r.op_and_data_type);
                payload.put_u64(r.updated_at_ns);
            }
            Request::Scan(r) => {
                payload.put_u8(REQ_SCAN);
                payload.put_bytes(&r.prefix);
                payload.put_u64(r.partition_hash);
                payload.put_bytes(&r.last_seen_key);
                payload.put_u32(r.limit);
            }
        }
    }

    fn get(bytes: &mut Bytes) -> Result<Self, Error> {
        Ok(match get_u8(bytes)? {
            REQ_GET => Request::Get(GetRequest {
                key: get_bytes(bytes)?,
                partition_hash: get_u64(bytes)?,
            }),
            REQ_PUT => Request::Put(PutRequest {
                key: get_bytes(bytes)?,
                partition_hash: get_u64(bytes)?,
                value: get_bytes(bytes)?,
                ttl_second: get_u32(bytes)?,
                op_and_data_type: get_u8(bytes)?,
                updated_at_ns: get_u64(bytes)?,
            }),
            REQ_DELETE => Request::Delete(DeleteRequest {
                key: get_bytes(bytes)?,
                partition_hash: get_u64(bytes)?,
                updated_at_ns: get_u64(bytes)?,
            }),
            REQ_MERGE => Request::Merge(MergeRequest {
                key: get_bytes(bytes)?,
                partition_hash: get_u64(bytes)?,
                value: get_bytes(bytes)?,
                op_and_data_type: get_u8(bytes)?,
                updated_at_ns: get_u64(bytes)?,
            }),
            REQ_SCAN => Request::Scan(ScanRequest {
                prefix: get_bytes(bytes)?,
                partition_hash: get_u64(bytes)?,
                last_seen_key: get_bytes(bytes)?,
                limit: get_u32(bytes)?,
            }),
            tag => return Err(Error::UnknownTag("request", tag)),
        })
    }
}

/// A key and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

impl KeyValue {
    pub fn put(&self, payload: &mut Payload) {
        payload.put_bytes(&self.key);
        payload.put_bytes(&self.value);
    }

    pub fn get(bytes: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            key: get_bytes(bytes)?,
            value: get_bytes(bytes)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    pub ok: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse {
    pub ok: bool,
    pub status: String,
    pub key_value: Option<KeyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanResponse {
    pub ok: bool,
    pub status: String,
    pub key_values: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Write(WriteResponse),
    Get(GetResponse),
    Scan(ScanResponse),
}

impl Response {
    pub fn ok() -> Self {
        Response::Write(WriteResponse {
            ok: true,
            status: String::new(),
        })
    }

    pub fn error(status: impl ToString) -> Self {
        Response::Write(WriteResponse {
            ok: false,
            status: status.to_string(),
        })
    }

    pub fn is_ok(&self) -> bool {
        match self {
            Response::Write(r) => r.ok,
            Response::Get(r) => r.ok,
            Response::Scan(r) => r.ok,
        }
    }

    pub fn status(&self) -> &str {
        match self {
            Response::Write(r) => &r.status,
            Response::Get(r) => &r.status,
            Response::Scan(r) => &r.status,
        }
    }

    pub fn is_wrong_shard(&self) -> bool {
        !self.is_ok() && self.status() == WRONG_SHARD
    }

    fn put(&self, payload: &mut Payload) {
        match self {
            Response::Write(r) => {
                payload.put_u8(RESP_WRITE);
                payload.put_bool(r.ok);
                payload.put_string(&r.status);
            }
            Response::Get(r) => {
                payload.put_u8(RESP_GET);
                payload.put_bool(r.ok);
                payload.put_string(&r.status);
                match &r.key_value {
                    Some(kv) => {
                        payload.put_bool(true);
                        kv.put(payload);
                    }
                    None => payload.put_bool(false),
                }
            }
            Response::Scan(r) => {
                payload.put_u8(RESP_SCAN);
                payload.put_bool(r.ok);
                payload.put_string(&r.status);
                payload.put_u32(r.key_values.len() as u32);
                for kv in &r.key_values {
                    kv.put(payload);
                }
            }
        }
    }

    fn get(bytes: &mut Bytes) -> Result<Self, Error> {
        Ok(match get_u8(bytes)? {
            RESP_WRITE => Response::Write(WriteResponse {
                ok: get_bool(bytes)?,
                status: get_string(bytes)?,
            }),
            RESP_GET => {
                let ok = get_bool(bytes)?;
                let status = get_string(bytes)?;
                let key_value = if get_bool(bytes)? {
                    Some(KeyValue::get(bytes)?)
                } else {
                    None
                };
                Response::Get(GetResponse {
                    ok,
                    status,
                    key_value,
                })
            }
            RESP_SCAN => {
                let ok = get_bool(bytes)?;
                let status = get_string(bytes)?;
                let key_values = (0..get_u32(bytes)?)
                    .map(|_| KeyValue::get(bytes))
                    .collect::<Result<Vec<_>, _>>()?;
                Response::Scan(ScanResponse {
                    ok,
                    status,
                    key_values,
                })
            }
            tag => return Err(Error::UnknownTag("response", tag)),
        })
    }
}

/// Batch of operations for one store.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub keyspace: String,
    pub requests: Vec<Request>,
}

impl ToBytes for BatchRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        payload.put_u32(self.requests.len() as u32);
        for request in &self.requests {
            request.put(&mut payload);
        }
        Ok(payload.freeze())
    }
}

impl FromBytes for BatchRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'Q');
        let keyspace = get_string(&mut bytes)?;
        let requests = (0..get_u32(&mut bytes)?)
            .map(|_| Request::get(&mut bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keyspace, requests })
    }
}

impl Protocol for BatchRequest {
    fn code(&self) -> char {
        'Q'
    }
}

/// Responses, one per request, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResponse {
    pub responses: Vec<Response>,
}

impl ToBytes for BatchResponse {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            response.put(&mut payload);
        }
        Ok(payload.freeze())
    }
}

impl FromBytes for BatchResponse {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'R');
        let responses = (0..get_u32(&mut bytes)?)
            .map(|_| Response::get(&mut bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { responses })
    }
}

impl Protocol for BatchResponse {
    fn code(&self) -> char {
        'R'
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_request_roundtrip() {
        let batch = BatchRequest {
            keyspace: "ks".into(),
            requests: vec![
                Request::Get(GetRequest {
                    key: Bytes::from_static(b"a"),
                    partition_hash: 1,
                }),
                Request::Put(PutRequest {
                    key: Bytes::from_static(b""),
                    partition_hash: 2,
                    value: Bytes::from_static(b"v"),
                    ttl_second: 0,
                    op_and_data_type: 0,
                    updated_at_ns: 99,
                }),
                Request::Delete(DeleteRequest {
                    key: Bytes::from_static(b"x"),
                    partition_hash: 3,
                    updated_at_ns: 100,
                }),
                Request::Merge(MergeRequest {
                    key: Bytes::from_static(b"m"),
                    partition_hash: 4,
                    value: Bytes::from_static(b"op"),
                    op_and_data_type: 1,
                    updated_at_ns: 101,
                }),
                Request::Scan(ScanRequest {
                    prefix: Bytes::from_static(b"p:"),
                    partition_hash: 5,
                    last_seen_key: Bytes::new(),
                    limit: 10,
                }),
            ],
        };

        let decoded = BatchRequest::from_bytes(batch.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn batch_response_roundtrip() {
        let batch = BatchResponse {
            responses: vec![
                Response::ok(),
                Response::error(WRONG_SHARD),
                Response::Get(GetResponse {
                    ok: true,
                    status: String::new(),
                    key_value: Some(KeyValue {
                        key: Bytes::from_static(b"a"),
                        value: Bytes::from_static(b"1"),
                    }),
                }),
                Response::Get(GetResponse {
                    ok: false,
                    status: "not found".into(),
                    key_value: None,
                }),
                Response::Scan(ScanResponse {
                    ok: true,
                    status: String::new(),
                    key_values: vec![KeyValue {
                        key: Bytes::from_static(b"p:1"),
                        value: Bytes::from_static(b"v"),
                    }],
                }),
            ],
        };

        let decoded = BatchResponse::from_bytes(batch.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, batch);
        assert!(decoded.responses[1].is_wrong_shard());
        assert!(!decoded.responses[0].is_wrong_shard());
    }
}
