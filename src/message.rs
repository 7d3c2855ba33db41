//! A module which contains the definition of all messages exchanged by the
//! lattice agreement protocols and the coordinator, together with their wire
//! encoding.
//!
//! Each payload starts with one hand-written discriminant byte (two for the
//! generalized proposer messages, which carry a sub-type); the remaining
//! fields are bincode-encoded in the documented order. Discriminant values
//! and field orders are part of the wire contract and must not change.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{decode_body, encode_tagged, split_tag, DecodeError};

// Recipient discriminants of the Faleiro wire format.
const TO_ACCEPTOR: u8 = 0;
const TO_PROPOSER: u8 = 1;
const TO_LEARNER: u8 = 2;

// Sub-types of a generalized ToProposer message.
const ACCEPT: u8 = 0;
const N_ACCEPT: u8 = 1;
const INTERNAL_RECEIVE: u8 = 2;

// Zheng message types.
const ZHENG_WRITE: u8 = 0;
const ZHENG_READ: u8 = 1;
const ZHENG_WRITE_ACK: u8 = 2;
const ZHENG_READ_ACK: u8 = 3;
const ZHENG_VALUE: u8 = 4;

// Coordinator message types.
const COORD_REGISTER: u8 = 0;
const COORD_TEST_COMPLETE: u8 = 1;
const COORD_START: u8 = 2;
const COORD_STOP: u8 = 3;
const COORD_TEST_INFO: u8 = 4;

/// A message of the single-shot Faleiro protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum FaleiroMessage<L> {
    /// A proposal broadcast by a proposer to every acceptor.
    Proposal {
        proposal_number: u64,
        proposed_value: L,
        proposer_id: u64,
    },

    /// An acceptor accepted the proposed value as-is.
    Ack {
        proposal_number: u64,
        proposer_id: u64,
        value: L,
    },

    /// An acceptor rejected the proposal; `value` is the acceptor's (larger)
    /// accepted value the proposer must fold into its next refinement.
    Nack {
        proposal_number: u64,
        proposer_id: u64,
        value: L,
    },
}

impl<L> FaleiroMessage<L>
where
    L: Serialize + DeserializeOwned,
{
    pub fn encode(&self) -> Vec<u8> {
        match self {
            FaleiroMessage::Proposal {
                proposal_number,
                proposed_value,
                proposer_id,
            } => encode_tagged(TO_ACCEPTOR, &(proposal_number, proposed_value, proposer_id)),
            FaleiroMessage::Ack {
                proposal_number,
                proposer_id,
                value,
            } => encode_tagged(TO_PROPOSER, &(1u8, proposal_number, proposer_id, value)),
            FaleiroMessage::Nack {
                proposal_number,
                proposer_id,
                value,
            } => encode_tagged(TO_PROPOSER, &(0u8, proposal_number, proposer_id, value)),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (recipient, body) = split_tag(payload)?;
        match recipient {
            TO_ACCEPTOR => {
                let (proposal_number, proposed_value, proposer_id) = decode_body(body)?;
                Ok(FaleiroMessage::Proposal {
                    proposal_number,
                    proposed_value,
                    proposer_id,
                })
            }
            TO_PROPOSER => {
                let (is_ack, rest) = split_tag(body)?;
                let (proposal_number, proposer_id, value) = decode_body(rest)?;
                match is_ack {
                    1 => Ok(FaleiroMessage::Ack {
                        proposal_number,
                        proposer_id,
                        value,
                    }),
                    0 => Ok(FaleiroMessage::Nack {
                        proposal_number,
                        proposer_id,
                        value,
                    }),
                    other => Err(DecodeError::UnknownTag(other)),
                }
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// A message of the generalized Faleiro protocol. Proposals look exactly like
/// the single-shot ones; proposer replies carry a sub-type byte, and acks are
/// additionally fanned out to every learner.
#[derive(Debug, Clone, PartialEq)]
pub enum GlaMessage<L> {
    Proposal {
        proposal_number: u64,
        proposed_value: L,
        proposer_id: u64,
    },

    Ack {
        proposal_number: u64,
        proposer_id: u64,
        value: L,
    },

    Nack {
        proposal_number: u64,
        proposer_id: u64,
        value: L,
    },

    /// A value handed to some process from the outside, forwarded so every
    /// proposer can buffer it.
    InternalReceive { value: L },

    /// An acceptor's ack as seen by a learner.
    LearnerAck {
        proposal_number: u64,
        value: L,
        proposer_id: u64,
    },
}

impl<L> GlaMessage<L>
where
    L: Serialize + DeserializeOwned,
{
    pub fn encode(&self) -> Vec<u8> {
        match self {
            GlaMessage::Proposal {
                proposal_number,
                proposed_value,
                proposer_id,
            } => encode_tagged(TO_ACCEPTOR, &(proposal_number, proposed_value, proposer_id)),
            GlaMessage::Ack {
                proposal_number,
                proposer_id,
                value,
            } => {
                let mut payload = vec![TO_PROPOSER];
                payload.extend(encode_tagged(ACCEPT, &(proposal_number, proposer_id, value)));
                payload
            }
            GlaMessage::Nack {
                proposal_number,
                proposer_id,
                value,
            } => {
                let mut payload = vec![TO_PROPOSER];
                payload.extend(encode_tagged(N_ACCEPT, &(proposal_number, proposer_id, value)));
                payload
            }
            GlaMessage::InternalReceive { value } => {
                let mut payload = vec![TO_PROPOSER];
                payload.extend(encode_tagged(INTERNAL_RECEIVE, &value));
                payload
            }
            GlaMessage::LearnerAck {
                proposal_number,
                value,
                proposer_id,
            } => encode_tagged(TO_LEARNER, &(proposal_number, value, proposer_id)),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (recipient, body) = split_tag(payload)?;
        match recipient {
            TO_ACCEPTOR => {
                let (proposal_number, proposed_value, proposer_id) = decode_body(body)?;
                Ok(GlaMessage::Proposal {
                    proposal_number,
                    proposed_value,
                    proposer_id,
                })
            }
            TO_PROPOSER => {
                let (sub_type, rest) = split_tag(body)?;
                match sub_type {
                    ACCEPT => {
                        let (proposal_number, proposer_id, value) = decode_body(rest)?;
                        Ok(GlaMessage::Ack {
                            proposal_number,
                            proposer_id,
                            value,
                        })
                    }
                    N_ACCEPT => {
                        let (proposal_number, proposer_id, value) = decode_body(rest)?;
                        Ok(GlaMessage::Nack {
                            proposal_number,
                            proposer_id,
                            value,
                        })
                    }
                    INTERNAL_RECEIVE => {
                        let value = decode_body(rest)?;
                        Ok(GlaMessage::InternalReceive { value })
                    }
                    other => Err(DecodeError::UnknownTag(other)),
                }
            }
            TO_LEARNER => {
                let (proposal_number, value, proposer_id) = decode_body(body)?;
                Ok(GlaMessage::LearnerAck {
                    proposal_number,
                    value,
                    proposer_id,
                })
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// The register entries exchanged by the Zheng classifier: a vector of
/// lattices plus the classifier threshold it was written under.
pub type AcceptEntry<L> = (Vec<L>, f64);

/// A message of the Zheng classifier protocol. Every message carries the
/// sender id and a per-process monotone message id; the id is informational
/// (tracing) and never used for correctness.
#[derive(Debug, Clone, PartialEq)]
pub enum ZhengMessage<L> {
    Write {
        from: u64,
        message_id: u64,
        value: Vec<L>,
        k: f64,
        r: u64,
    },

    Read {
        from: u64,
        message_id: u64,
        r: u64,
    },

    WriteAck {
        from: u64,
        message_id: u64,
        rec_val: Vec<AcceptEntry<L>>,
        r: u64,
    },

    ReadAck {
        from: u64,
        message_id: u64,
        rec_val: Vec<AcceptEntry<L>>,
        r: u64,
    },

    Value {
        from: u64,
        message_id: u64,
        value: Vec<L>,
    },
}

impl<L> ZhengMessage<L>
where
    L: Serialize + DeserializeOwned,
{
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ZhengMessage::Write {
                from,
                message_id,
                value,
                k,
                r,
            } => encode_tagged(ZHENG_WRITE, &(from, message_id, value, k, r)),
            ZhengMessage::Read { from, message_id, r } => {
                encode_tagged(ZHENG_READ, &(from, message_id, r))
            }
            ZhengMessage::WriteAck {
                from,
                message_id,
                rec_val,
                r,
            } => encode_tagged(ZHENG_WRITE_ACK, &(from, message_id, rec_val, r)),
            ZhengMessage::ReadAck {
                from,
                message_id,
                rec_val,
                r,
            } => encode_tagged(ZHENG_READ_ACK, &(from, message_id, rec_val, r)),
            ZhengMessage::Value {
                from,
                message_id,
                value,
            } => encode_tagged(ZHENG_VALUE, &(from, message_id, value)),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (message_type, body) = split_tag(payload)?;
        match message_type {
            ZHENG_WRITE => {
                let (from, message_id, value, k, r) = decode_body(body)?;
                Ok(ZhengMessage::Write {
                    from,
                    message_id,
                    value,
                    k,
                    r,
                })
            }
            ZHENG_READ => {
                let (from, message_id, r) = decode_body(body)?;
                Ok(ZhengMessage::Read { from, message_id, r })
            }
            ZHENG_WRITE_ACK => {
                let (from, message_id, rec_val, r) = decode_body(body)?;
                Ok(ZhengMessage::WriteAck {
                    from,
                    message_id,
                    rec_val,
                    r,
                })
            }
            ZHENG_READ_ACK => {
                let (from, message_id, rec_val, r) = decode_body(body)?;
                Ok(ZhengMessage::ReadAck {
                    from,
                    message_id,
                    rec_val,
                    r,
                })
            }
            ZHENG_VALUE => {
                let (from, message_id, value) = decode_body(body)?;
                Ok(ZhengMessage::Value {
                    from,
                    message_id,
                    value,
                })
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// One participant entry of a TestInfo message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub port: u64,
    pub ip: String,
    pub id: u64,
}

/// A message of the coordinator handshake. LA-family tests use `values[0]` of
/// a TestInfo and report a single-element result vector; the generalized
/// protocol uses the whole vector.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorMessage<L> {
    Register {
        protocol_port: u64,
        client_port: u64,
        ip: String,
    },

    TestComplete {
        elapsed_micros: u64,
        id: u64,
        values: Vec<L>,
    },

    Start,

    Stop,

    TestInfo {
        n: u64,
        f: u64,
        values: Vec<L>,
        peers: Vec<PeerInfo>,
    },
}

impl<L> CoordinatorMessage<L>
where
    L: Serialize + DeserializeOwned,
{
    pub fn encode(&self) -> Vec<u8> {
        match self {
            CoordinatorMessage::Register {
                protocol_port,
                client_port,
                ip,
            } => encode_tagged(COORD_REGISTER, &(protocol_port, client_port, ip)),
            CoordinatorMessage::TestComplete {
                elapsed_micros,
                id,
                values,
            } => encode_tagged(COORD_TEST_COMPLETE, &(elapsed_micros, id, values)),
            CoordinatorMessage::Start => vec![COORD_START],
            CoordinatorMessage::Stop => vec![COORD_STOP],
            CoordinatorMessage::TestInfo { n, f, values, peers } => {
                encode_tagged(COORD_TEST_INFO, &(n, f, values, peers))
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (message_type, body) = split_tag(payload)?;
        match message_type {
            COORD_REGISTER => {
                let (protocol_port, client_port, ip) = decode_body(body)?;
                Ok(CoordinatorMessage::Register {
                    protocol_port,
                    client_port,
                    ip,
                })
            }
            COORD_TEST_COMPLETE => {
                let (elapsed_micros, id, values) = decode_body(body)?;
                Ok(CoordinatorMessage::TestComplete {
                    elapsed_micros,
                    id,
                    values,
                })
            }
            COORD_START => Ok(CoordinatorMessage::Start),
            COORD_STOP => Ok(CoordinatorMessage::Stop),
            COORD_TEST_INFO => {
                let (n, f, values, peers) = decode_body(body)?;
                Ok(CoordinatorMessage::TestInfo { n, f, values, peers })
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// The reply to a Register message: the assigned process id, framed on its
/// own as a bare number.
pub fn encode_assigned_id(id: u64) -> Vec<u8> {
    bincode::serialize(&id).expect("u64 is serializable")
}

pub fn decode_assigned_id(payload: &[u8]) -> Result<u64, DecodeError> {
    decode_body(payload)
}
