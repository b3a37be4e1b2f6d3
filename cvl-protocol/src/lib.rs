#![forbid(unsafe_code)]

/// Protocol-level types for CVL ledger interactions.
pub mod cvl {
    pub mod v1 {
        use blake3::Hasher;
        use prost::Message;
        use rand_core::{OsRng, RngCore};
        use thiserror::Error;

        #[cfg(feature = "serde")]
        use serde::{Deserialize, Serialize};

        /// Contract kind of value instances.
        pub const VALUE_CONTRACT_KIND: &str = "value";

        /// Invocation command evolving a value instance.
        pub const UPDATE_COMMAND: &str = "update";

        /// Darc rule a signer must satisfy to evolve a value instance.
        pub const UPDATE_RULE: &str = "invoke:update";

        /// 32-byte digest wrapper used across protocol structs.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct Digest32(pub [u8; 32]);

        impl Digest32 {
            pub fn zero() -> Self {
                Self([0u8; 32])
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                if bytes.len() != 32 {
                    return None;
                }

                let mut digest = [0u8; 32];
                digest.copy_from_slice(bytes);
                Some(Self(digest))
            }

            pub fn to_vec(&self) -> Vec<u8> {
                self.0.to_vec()
            }
        }

        /// Errors raised while assembling or decoding protocol values.
        #[derive(Debug, Error, Clone, PartialEq, Eq)]
        pub enum ProtocolError {
            #[error("instance id must be {expected} bytes, got {actual}")]
            InvalidInstanceIdLength { expected: usize, actual: usize },
            #[error("transaction unit must contain at least one instruction")]
            EmptyTransaction,
            #[error(
                "instruction {position} declares placement {index}/{length} in a unit of {actual}"
            )]
            InconsistentPlacement {
                position: usize,
                index: u32,
                length: u32,
                actual: usize,
            },
        }

        /// Identifier of the darc governing an instance.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct DarcId(pub [u8; 32]);

        /// Sub-identifier distinguishing instances under one darc, and used
        /// as the collision-resistant instruction nonce.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct SubId(pub [u8; 32]);

        impl SubId {
            pub fn zero() -> Self {
                Self([0u8; 32])
            }

            /// Draw a fresh random sub-identifier from the OS generator.
            pub fn random() -> Self {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                Self(bytes)
            }
        }

        /// Identifier of a ledger instance: the governing darc id followed by
        /// a sub-identifier. Encodes to 64 bytes.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct InstanceId {
            darc_id: DarcId,
            sub_id: SubId,
        }

        /// Encoded length of an [`InstanceId`].
        pub const INSTANCE_ID_LENGTH: usize = 64;

        impl InstanceId {
            pub fn new(darc_id: DarcId, sub_id: SubId) -> Self {
                Self { darc_id, sub_id }
            }

            /// Id of the darc governing this instance.
            pub fn darc_id(&self) -> DarcId {
                self.darc_id
            }

            pub fn sub_id(&self) -> SubId {
                self.sub_id
            }

            pub fn to_bytes(&self) -> [u8; INSTANCE_ID_LENGTH] {
                let mut bytes = [0u8; INSTANCE_ID_LENGTH];
                bytes[..32].copy_from_slice(&self.darc_id.0);
                bytes[32..].copy_from_slice(&self.sub_id.0);
                bytes
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
                if bytes.len() != INSTANCE_ID_LENGTH {
                    return Err(ProtocolError::InvalidInstanceIdLength {
                        expected: INSTANCE_ID_LENGTH,
                        actual: bytes.len(),
                    });
                }

                let mut darc_id = [0u8; 32];
                darc_id.copy_from_slice(&bytes[..32]);
                let mut sub_id = [0u8; 32];
                sub_id.copy_from_slice(&bytes[32..]);
                Ok(Self {
                    darc_id: DarcId(darc_id),
                    sub_id: SubId(sub_id),
                })
            }
        }

        /// Authenticated state proof as fetched from a ledger node. The
        /// cryptographic validity of the proof against the global state root
        /// is established by the transport collaborator before this envelope
        /// is handed over.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, PartialEq, Eq, Message)]
        pub struct ProofEnvelope {
            #[prost(bytes = "vec", tag = "1")]
            pub key: Vec<u8>,
            #[prost(string, tag = "2")]
            pub contract_kind: String,
            #[prost(bytes = "vec", tag = "3")]
            pub value: Vec<u8>,
        }

        /// Typed snapshot of a ledger instance decoded from a proof.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct Instance {
            pub id: InstanceId,
            pub contract_kind: String,
            pub data: Vec<u8>,
        }

        impl Instance {
            /// Decode the instance carried by a proof envelope.
            pub fn from_proof(proof: &ProofEnvelope) -> Result<Self, ProtocolError> {
                let id = InstanceId::from_slice(&proof.key)?;
                Ok(Self {
                    id,
                    contract_kind: proof.contract_kind.clone(),
                    data: proof.value.clone(),
                })
            }
        }

        /// Public identity descriptor of a signer.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct Identity {
            pub public_key: [u8; 32],
        }

        /// A signature over a request digest together with the identity that
        /// produced it.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct InstructionSignature {
            pub signature: Vec<u8>,
            pub signer: Identity,
        }

        /// Invocation descriptor of a state transition.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct Invoke {
            pub command: String,
            pub contract_kind: String,
            pub argument: Vec<u8>,
        }

        /// One proposed state transition targeting a single instance.
        ///
        /// Signatures are appended after the governing request has been
        /// signed; they never replace earlier ones.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct Instruction {
            pub target: InstanceId,
            pub nonce: SubId,
            pub index: u32,
            pub length: u32,
            pub invoke: Invoke,
            pub signatures: Vec<InstructionSignature>,
        }

        impl Instruction {
            /// Build an unsigned instruction.
            pub fn new(
                target: InstanceId,
                nonce: SubId,
                index: u32,
                length: u32,
                invoke: Invoke,
            ) -> Self {
                Self {
                    target,
                    nonce,
                    index,
                    length,
                    invoke,
                    signatures: Vec::new(),
                }
            }

            /// Digest over the instruction without its signatures; this is
            /// the value bound into the request that signers authorize.
            pub fn digest(&self) -> [u8; 32] {
                let mut hasher = Hasher::new();
                hasher.update(b"CVL:HASH:INSTRUCTION");
                hasher.update(&self.target.to_bytes());
                hasher.update(&self.nonce.0);
                hasher.update(&self.index.to_le_bytes());
                hasher.update(&self.length.to_le_bytes());
                hasher.update(self.invoke.command.as_bytes());
                hasher.update(self.invoke.contract_kind.as_bytes());
                hasher.update(&self.invoke.argument);
                *hasher.finalize().as_bytes()
            }

            pub fn append_signature(&mut self, signature: InstructionSignature) {
                self.signatures.push(signature);
            }
        }

        /// Governed-action descriptor hashed and signed to authorize an
        /// instruction against a darc rule.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct Request {
            pub darc_id: DarcId,
            pub rule: String,
            pub instruction_digest: [u8; 32],
            pub identities: Vec<Identity>,
            pub extra: Option<Vec<u8>>,
        }

        impl Request {
            /// Digest that signers sign. Identity order is significant: the
            /// policy engine evaluates the identities as listed.
            pub fn digest(&self) -> [u8; 32] {
                let mut hasher = Hasher::new();
                hasher.update(b"CVL:SIGN:REQUEST");
                hasher.update(&self.darc_id.0);
                hasher.update(self.rule.as_bytes());
                hasher.update(&self.instruction_digest);
                for identity in &self.identities {
                    hasher.update(&identity.public_key);
                }
                match &self.extra {
                    Some(extra) => {
                        hasher.update(&[1u8]);
                        hasher.update(extra);
                    }
                    None => {
                        hasher.update(&[0u8]);
                    }
                }
                *hasher.finalize().as_bytes()
            }
        }

        /// Reference correlating a submitted transaction unit, derived from
        /// the unit's actual content.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct TransactionId(pub Digest32);

        impl TransactionId {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0 .0
            }
        }

        /// Ordered group of instructions applied atomically by the ledger.
        ///
        /// The idempotency token lets the submission collaborator deduplicate
        /// a unit that is retried after a transient transport failure.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct TransactionUnit {
            pub instructions: Vec<Instruction>,
            pub token: [u8; 32],
        }

        impl TransactionUnit {
            /// Assemble a unit with a fresh idempotency token.
            pub fn new(instructions: Vec<Instruction>) -> Result<Self, ProtocolError> {
                let mut token = [0u8; 32];
                OsRng.fill_bytes(&mut token);
                Self::with_token(instructions, token)
            }

            /// Assemble a unit with a caller-supplied token. Every
            /// instruction's declared placement must match the unit's actual
            /// composition.
            pub fn with_token(
                instructions: Vec<Instruction>,
                token: [u8; 32],
            ) -> Result<Self, ProtocolError> {
                if instructions.is_empty() {
                    return Err(ProtocolError::EmptyTransaction);
                }

                let actual = instructions.len();
                for (position, instruction) in instructions.iter().enumerate() {
                    if instruction.index as usize != position
                        || instruction.length as usize != actual
                    {
                        return Err(ProtocolError::InconsistentPlacement {
                            position,
                            index: instruction.index,
                            length: instruction.length,
                            actual,
                        });
                    }
                }

                Ok(Self {
                    instructions,
                    token,
                })
            }

            /// Transaction reference derived from the unit content.
            pub fn id(&self) -> TransactionId {
                let mut hasher = Hasher::new();
                hasher.update(b"CVL:HASH:TRANSACTION");
                hasher.update(&self.token);
                for instruction in &self.instructions {
                    hasher.update(&instruction.digest());
                }
                TransactionId(Digest32(*hasher.finalize().as_bytes()))
            }
        }
    }
}
