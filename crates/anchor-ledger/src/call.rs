use anchor_crypto::hash;

use crate::error::LedgerError;

const REGISTER_SIG: &str = "registerDID(bytes32,string,string)";
const UPDATE_SIG: &str = "updateDID(bytes32,string,string)";
const REVOKE_SIG: &str = "revokeDID(bytes32)";

/// A write call against the DID registry contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Register {
        user_hash: String,
        did: String,
        metadata: String,
    },
    Update {
        user_hash: String,
        did: String,
        metadata: String,
    },
    Revoke {
        user_hash: String,
    },
}

fn selector_of(signature: &str) -> [u8; 4] {
    let h = hash(signature.as_bytes());
    [h[0], h[1], h[2], h[3]]
}

fn bytes32(user_hash: &str) -> Result<[u8; 32], LedgerError> {
    let raw = hex::decode(user_hash.trim_start_matches("0x"))
        .map_err(|e| LedgerError::Encoding(format!("user hash is not hex: {}", e)))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| LedgerError::Encoding(format!("user hash must be 32 bytes, got {}", raw.len())))
}

fn push_arg(out: &mut Vec<u8>, arg: &[u8]) {
    out.extend_from_slice(&(arg.len() as u32).to_be_bytes());
    out.extend_from_slice(arg);
}

struct Args<'a> {
    data: &'a [u8],
}

impl<'a> Args<'a> {
    fn next(&mut self) -> Result<&'a [u8], LedgerError> {
        let truncated = || LedgerError::Encoding("call data truncated".into());
        let (len, rest) = self.data.split_first_chunk::<4>().ok_or_else(truncated)?;
        let len = u32::from_be_bytes(*len) as usize;
        if rest.len() < len {
            return Err(truncated());
        }
        let (arg, rest) = rest.split_at(len);
        self.data = rest;
        Ok(arg)
    }

    fn string(&mut self) -> Result<String, LedgerError> {
        String::from_utf8(self.next()?.to_vec())
            .map_err(|e| LedgerError::Encoding(format!("invalid utf-8 argument: {}", e)))
    }

    fn hash(&mut self) -> Result<String, LedgerError> {
        let arg = self.next()?;
        if arg.len() != 32 {
            return Err(LedgerError::Encoding("bytes32 argument has wrong length".into()));
        }
        Ok(hex::encode(arg))
    }

    fn finish(self) -> Result<(), LedgerError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::Encoding("trailing call data".into()))
        }
    }
}

impl RegistryCall {
    pub fn signature(&self) -> &'static str {
        match self {
            Self::Register { .. } => REGISTER_SIG,
            Self::Update { .. } => UPDATE_SIG,
            Self::Revoke { .. } => REVOKE_SIG,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Update { .. } => "update",
            Self::Revoke { .. } => "revoke",
        }
    }

    /// Four-byte function selector followed by length-prefixed arguments.
    pub fn encode(&self) -> Result<Vec<u8>, LedgerError> {
        let mut out = selector_of(self.signature()).to_vec();
        match self {
            Self::Register {
                user_hash,
                did,
                metadata,
            }
            | Self::Update {
                user_hash,
                did,
                metadata,
            } => {
                push_arg(&mut out, &bytes32(user_hash)?);
                push_arg(&mut out, did.as_bytes());
                push_arg(&mut out, metadata.as_bytes());
            }
            Self::Revoke { user_hash } => {
                push_arg(&mut out, &bytes32(user_hash)?);
            }
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, LedgerError> {
        let (selector, rest) = data
            .split_first_chunk::<4>()
            .ok_or_else(|| LedgerError::Encoding("call data shorter than selector".into()))?;
        let mut args = Args { data: rest };

        let call = if *selector == selector_of(REGISTER_SIG) {
            Self::Register {
                user_hash: args.hash()?,
                did: args.string()?,
                metadata: args.string()?,
            }
        } else if *selector == selector_of(UPDATE_SIG) {
            Self::Update {
                user_hash: args.hash()?,
                did: args.string()?,
                metadata: args.string()?,
            }
        } else if *selector == selector_of(REVOKE_SIG) {
            Self::Revoke {
                user_hash: args.hash()?,
            }
        } else {
            return Err(LedgerError::Encoding(format!(
                "unknown selector {}",
                hex::encode(selector)
            )));
        };
        args.finish()?;
        Ok(call)
    }
}
