use crate::SecretHash;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum FromErr {
    #[error("expected {expected} bytes but got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid hex")]
    FromHex(#[from] hex::FromHexError),
}

/// The preimage of a hash lock.
///
/// Whoever knows the secret can claim every payment locked to its hash, hence
/// it never travels over the peer protocol. It only becomes known to the
/// counterparty by claiming a payment on one of the payment networks.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct Secret([u8; Self::LENGTH]);

impl From<[u8; Self::LENGTH]> for Secret {
    fn from(secret: [u8; Self::LENGTH]) -> Self {
        Secret(secret)
    }
}

impl Secret {
    pub const LENGTH: usize = 32;

    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);

        Secret(bytes)
    }

    pub fn from_vec(vec: &[u8]) -> Result<Secret, FromErr> {
        if vec.len() != Self::LENGTH {
            return Err(FromErr::InvalidLength {
                expected: Self::LENGTH,
                got: vec.len(),
            });
        }
        let mut data = [0; Self::LENGTH];
        data.copy_from_slice(vec);
        Ok(Secret(data))
    }

    pub fn hash(&self) -> SecretHash {
        let digest = Sha256::digest(&self.0);
        let mut hash = [0u8; SecretHash::LENGTH];
        hash.copy_from_slice(&digest);

        SecretHash::from(hash)
    }

    /// Whether this secret unlocks payments locked to `secret_hash`.
    pub fn unlocks(&self, secret_hash: &SecretHash) -> bool {
        &self.hash() == secret_hash
    }

    pub fn as_raw_secret(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl fmt::LowerHex for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(hex::encode(&self.0).as_str())
    }
}

impl FromStr for Secret {
    type Err = FromErr;

    fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
        let vec = hex::decode(s)?;
        Self::from_vec(&vec)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'vde> de::Visitor<'vde> for Visitor {
            type Value = Secret;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                formatter.write_str("a hex encoded 32 byte value")
            }

            fn visit_str<E>(self, v: &str) -> Result<Secret, E>
            where
                E: de::Error,
            {
                Secret::from_str(v).map_err(|_| {
                    de::Error::invalid_value(de::Unexpected::Str(v), &"hex encoded bytes")
                })
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:x}", self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_secret_serialization() {
        let bytes = b"hello world, you are beautiful!!";
        let secret = Secret::from(*bytes);

        let json_secret = serde_json::to_string(&secret).unwrap();
        let deser_secret = serde_json::from_str::<Secret>(json_secret.as_str()).unwrap();

        assert_eq!(deser_secret, secret);
    }

    #[test]
    fn invalid_length_from_str() {
        let result =
            Secret::from_str("68d627971643a6f97f27c58957826fcba853ec2077fd10ec6b93d8e61deb4c");

        assert_eq!(result.unwrap_err(), FromErr::InvalidLength {
            expected: 32,
            got: 31
        });
    }

    #[test]
    fn hash_is_sha256_of_the_secret() {
        let secret = Secret::from(*b"hello world, you are beautiful!!");

        assert_eq!(
            secret.hash().to_string(),
            "68d627971643a6f97f27c58957826fcba853ec2077fd10ec6b93d8e61deb4cec"
        );
        assert!(secret.unlocks(&secret.hash()));
    }

    #[test]
    fn generated_secrets_differ() {
        assert_ne!(Secret::generate(), Secret::generate());
    }
}
