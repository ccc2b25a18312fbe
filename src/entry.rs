//! # Entries
//!
//! An [`Entry`] is a node's signed self-description: identity, reachable
//! endpoint, content counters and the seeds replicating its collection.
//!
//! ## Trust Model
//!
//! | Field group | Who may change it | Covered by signature |
//! |-------------|-------------------|----------------------|
//! | identity, endpoint, counters, `updated` | owner only | yes |
//! | `seeds` | anyone merging gossip | no |
//!
//! Seeds are gossip state: a SeedManager on another node merges seed lists it
//! learns about and writes the merged entry back to its DHT. Keeping the seed
//! list outside the signed bytes lets such an entry still verify.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::{sign_with_domain, verify_with_domain, ENTRY_SIGNATURE_DOMAIN};
use crate::error::{Error, Result};
use crate::identity::{Address, Keypair};
use crate::messages::encode;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(with = "hex_array")]
    pub public_key: [u8; 32],
    pub address: Address,
    pub name: String,
    pub description: String,
    /// Host part of the advertised endpoint.
    pub public_address: String,
    pub port: u16,
    pub post_count: u64,
    /// `BLAKE3` of the collection manifest's hash list.
    #[serde(with = "hex_array")]
    pub collection_hash: [u8; 32],
    /// Milliseconds since the unix epoch at last signing.
    pub updated: u64,
    #[serde(default)]
    pub seeds: Vec<Address>,
    #[serde(with = "hex_vec")]
    pub signature: Vec<u8>,
}

/// The signed view of an entry. Field order is part of the format.
#[derive(Serialize)]
struct SignedFields<'a> {
    public_key: &'a [u8; 32],
    address: &'a Address,
    name: &'a str,
    description: &'a str,
    public_address: &'a str,
    port: u16,
    post_count: u64,
    collection_hash: &'a [u8; 32],
    updated: u64,
}

impl Entry {
    /// A fresh, signed entry for `keypair`.
    pub fn new(keypair: &Keypair, public_address: impl Into<String>, port: u16) -> Self {
        let mut entry = Self {
            public_key: keypair.public_key_bytes(),
            address: keypair.address(),
            name: String::new(),
            description: String::new(),
            public_address: public_address.into(),
            port,
            post_count: 0,
            collection_hash: *blake3::hash(&[]).as_bytes(),
            updated: 0,
            seeds: Vec::new(),
            signature: Vec::new(),
        };
        entry.sign(keypair);
        entry
    }

    /// Canonical bytes covered by the signature.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let fields = SignedFields {
            public_key: &self.public_key,
            address: &self.address,
            name: &self.name,
            description: &self.description,
            public_address: &self.public_address,
            port: self.port,
            post_count: self.post_count,
            collection_hash: &self.collection_hash,
            updated: self.updated,
        };
        // Only primitive fields; encoding cannot fail.
        encode(&fields).unwrap_or_default()
    }

    /// Stamp `updated` and re-sign. Only the owner holds the keypair.
    pub fn sign(&mut self, keypair: &Keypair) {
        debug_assert_eq!(keypair.address(), self.address);
        self.updated = self.updated.max(now_millis());
        self.signature = sign_with_domain(keypair, ENTRY_SIGNATURE_DOMAIN, &self.signed_bytes());
    }

    /// Check the address binding and the signature.
    pub fn verify(&self) -> Result<()> {
        let derived = Address::from_public_key(&self.public_key);
        if derived != self.address {
            return Err(Error::IdentityMismatch {
                expected: derived,
                actual: self.address,
            });
        }
        verify_with_domain(
            &self.public_key,
            ENTRY_SIGNATURE_DOMAIN,
            &self.signed_bytes(),
            &self.signature,
        )?;
        Ok(())
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.public_address.contains(':') && !self.public_address.starts_with('[') {
            format!("[{}]:{}", self.public_address, self.port)
        } else {
            format!("{}:{}", self.public_address, self.port)
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Append `address` to the seed list unless already present.
    pub fn add_seed(&mut self, address: Address) -> bool {
        if address == self.address || self.seeds.contains(&address) {
            return false;
        }
        self.seeds.push(address);
        true
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_entry() -> (Keypair, Entry) {
        let kp = Keypair::generate();
        let mut entry = Entry::new(&kp, "127.0.0.1", 5050);
        entry.name = "alice".into();
        entry.sign(&kp);
        (kp, entry)
    }

    #[test]
    fn fresh_entry_verifies() {
        let (_, entry) = signed_entry();
        assert!(entry.verify().is_ok());
    }

    #[test]
    fn tampered_fields_fail_verification() {
        let (_, entry) = signed_entry();

        let mut tampered = entry.clone();
        tampered.post_count += 1;
        assert!(matches!(tampered.verify(), Err(Error::InvalidSignature(_))));

        let mut tampered = entry.clone();
        tampered.port = 1;
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn address_must_match_public_key() {
        let (_, mut entry) = signed_entry();
        entry.address = Address::from_bytes([7; 32]);
        assert!(matches!(entry.verify(), Err(Error::IdentityMismatch { .. })));
    }

    #[test]
    fn seeds_are_outside_the_signature() {
        let (_, mut entry) = signed_entry();
        assert!(entry.add_seed(Address::from_bytes([1; 32])));
        assert!(!entry.add_seed(Address::from_bytes([1; 32])));
        assert_eq!(entry.seeds.len(), 1);
        assert!(entry.verify().is_ok());
    }

    #[test]
    fn resigning_bumps_updated() {
        let (kp, mut entry) = signed_entry();
        let before = entry.updated;
        entry.post_count = 10;
        entry.sign(&kp);
        assert!(entry.updated >= before);
        assert!(entry.verify().is_ok());
    }

    #[test]
    fn json_preserves_signature() {
        let (_, mut entry) = signed_entry();
        entry.add_seed(Address::random());
        let json = entry.to_json().unwrap();
        let decoded = Entry::from_json(&json).unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn endpoint_formats_ipv6() {
        let kp = Keypair::generate();
        assert_eq!(Entry::new(&kp, "10.0.0.1", 80).endpoint(), "10.0.0.1:80");
        assert_eq!(Entry::new(&kp, "::1", 80).endpoint(), "[::1]:80");
    }
}
