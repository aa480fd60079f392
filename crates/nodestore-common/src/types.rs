//! Core type definitions for nodestore
//!
//! This module defines the fundamental types used throughout the system:
//! identifiers, addresses and the immutable object model.

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Size of object and container identifiers in bytes
pub const ID_SIZE: usize = 32;

/// Size of an owner identifier in bytes
pub const OWNER_ID_SIZE: usize = 25;

/// Attribute holding the last epoch at which an object is still alive
pub const ATTRIBUTE_EXPIRATION_EPOCH: &str = "__SYSTEM__EXPIRATION_EPOCH";

/// Attribute holding the MIME type of the payload
pub const ATTRIBUTE_CONTENT_TYPE: &str = "Content-Type";

/// Unique identifier for an object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct ObjectId([u8; ID_SIZE]);

impl ObjectId {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Create from a slice, checking its length
    pub fn from_slice(data: &[u8]) -> std::result::Result<Self, AddressError> {
        let bytes: [u8; ID_SIZE] = data.try_into().map_err(|_| AddressError::InvalidLength {
            expected: ID_SIZE,
            actual: data.len(),
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ObjectId {
    type Err = AddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_slice(&hex::decode(s)?)
    }
}

/// Unique identifier for a container
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct ContainerId([u8; ID_SIZE]);

impl ContainerId {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Create from a slice, checking its length
    pub fn from_slice(data: &[u8]) -> std::result::Result<Self, AddressError> {
        let bytes: [u8; ID_SIZE] = data.try_into().map_err(|_| AddressError::InvalidLength {
            expected: ID_SIZE,
            actual: data.len(),
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContainerId {
    type Err = AddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_slice(&hex::decode(s)?)
    }
}

/// Owner of an object (wallet script hash)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct OwnerId([u8; OWNER_ID_SIZE]);

impl OwnerId {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; OWNER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; OWNER_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", hex::encode(self.0))
    }
}

/// Errors that can occur when decoding identifiers and addresses
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AddressError {
    #[error("address must contain a '.' separator")]
    MissingSeparator,
    #[error("invalid identifier length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Address of an object: the primary key of every storage and index operation
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Container the object belongs to
    pub container: ContainerId,
    /// Object identifier within the container
    pub object: ObjectId,
}

impl Address {
    /// Length of the string form produced by [`Address::encode_to_string`]
    pub const ENCODED_LEN: usize = 4 * ID_SIZE + 1;

    /// Length of the binary index key produced by [`Address::to_key`]
    pub const KEY_LEN: usize = 2 * ID_SIZE;

    /// Create a new address
    #[must_use]
    pub const fn new(container: ContainerId, object: ObjectId) -> Self {
        Self { container, object }
    }

    /// Encode as `<object hex>.<container hex>`.
    ///
    /// The object part comes first so that filesystem sharding by leading
    /// characters spreads objects of one container across directories.
    #[must_use]
    pub fn encode_to_string(&self) -> String {
        format!("{}.{}", self.object, self.container)
    }

    /// Decode the string form produced by [`Address::encode_to_string`]
    pub fn decode_str(s: &str) -> std::result::Result<Self, AddressError> {
        let (object, container) = s.split_once('.').ok_or(AddressError::MissingSeparator)?;
        Ok(Self {
            container: container.parse()?,
            object: object.parse()?,
        })
    }

    /// Binary key used by the index: container bytes followed by object bytes
    #[must_use]
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..ID_SIZE].copy_from_slice(self.container.as_bytes());
        key[ID_SIZE..].copy_from_slice(self.object.as_bytes());
        key
    }

    /// Decode a binary key produced by [`Address::to_key`]
    pub fn from_key(key: &[u8]) -> std::result::Result<Self, AddressError> {
        if key.len() != Self::KEY_LEN {
            return Err(AddressError::InvalidLength {
                expected: Self::KEY_LEN,
                actual: key.len(),
            });
        }
        Ok(Self {
            container: ContainerId::from_slice(&key[..ID_SIZE])?,
            object: ObjectId::from_slice(&key[ID_SIZE..])?,
        })
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.encode_to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.object)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::decode_str(s)
    }
}

/// Type of an object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// User data
    #[default]
    Regular,
    /// Marks its members as removed
    Tombstone,
    /// Protects its members from removal
    Lock,
}

/// Key-value attribute of an object header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

/// Immutable object header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    /// Container the object belongs to
    pub container: ContainerId,
    /// Object type
    pub object_type: ObjectType,
    /// Owner of the object
    pub owner: OwnerId,
    /// User and system attributes
    pub attributes: Vec<Attribute>,
    /// Parent of a split object (same container)
    pub parent: Option<ObjectId>,
    /// Members of a tombstone or lock object (same container)
    pub members: Vec<ObjectId>,
    /// Payload length in bytes
    pub payload_length: u64,
    /// Payload checksum
    pub payload_checksum: Checksum,
}

impl ObjectHeader {
    /// Look up an attribute value by key
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    /// Expiration epoch, if the object carries a parseable one
    #[must_use]
    pub fn expiration_epoch(&self) -> Option<u64> {
        self.attribute(ATTRIBUTE_EXPIRATION_EPOCH)
            .and_then(|v| v.parse().ok())
    }

    /// Content type of the payload, if set
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.attribute(ATTRIBUTE_CONTENT_TYPE)
    }
}

/// Structured answer for a virtual (split) parent whose parts are stored
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitInfo {
    /// Address of the virtual parent
    pub parent: Address,
    /// Stored parts of the parent
    pub parts: Vec<ObjectId>,
}

/// Immutable content-addressed object: header plus payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    id: ObjectId,
    header: ObjectHeader,
    payload: Vec<u8>,
}

impl Object {
    /// Start building a regular object
    #[must_use]
    pub fn builder(container: ContainerId, owner: OwnerId) -> ObjectBuilder {
        ObjectBuilder::new(container, owner)
    }

    /// Object identifier
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Object address
    #[must_use]
    pub const fn address(&self) -> Address {
        Address::new(self.header.container, self.id)
    }

    /// Object header
    #[must_use]
    pub const fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Object type
    #[must_use]
    pub const fn object_type(&self) -> ObjectType {
        self.header.object_type
    }

    /// Payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Slice `[offset, offset + length)` of the payload.
    ///
    /// Returns `OutOfRange` if the end overflows or lies past the payload.
    pub fn payload_range(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let payload_length = self.payload.len() as u64;
        let out_of_range = || Error::OutOfRange {
            offset,
            length,
            payload_length,
        };
        let end = offset.checked_add(length).ok_or_else(out_of_range)?;
        if end > payload_length {
            return Err(out_of_range());
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(&self.payload[offset as usize..end as usize])
    }

    /// Address of the split parent, if any
    #[must_use]
    pub fn parent_address(&self) -> Option<Address> {
        self.header
            .parent
            .map(|id| Address::new(self.header.container, id))
    }

    /// Addresses of tombstone or lock members
    #[must_use]
    pub fn member_addresses(&self) -> Vec<Address> {
        self.header
            .members
            .iter()
            .map(|id| Address::new(self.header.container, *id))
            .collect()
    }

    /// Serialize into the raw form stored by every tier
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode the raw form and verify the identifier and payload checksum
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let obj: Self = bincode::deserialize(data)?;
        if obj.header.payload_length != obj.payload.len() as u64 {
            return Err(Error::Corrupted(format!(
                "object {}: payload length {} does not match header {}",
                obj.id,
                obj.payload.len(),
                obj.header.payload_length
            )));
        }
        if !obj.header.payload_checksum.verify_full(&obj.payload) {
            return Err(Error::Corrupted(format!(
                "object {}: payload checksum mismatch",
                obj.id
            )));
        }
        let expected = compute_id(&obj.header)?;
        if expected != obj.id {
            return Err(Error::Corrupted(format!(
                "object {}: identifier does not match header (expected {expected})",
                obj.id
            )));
        }
        Ok(obj)
    }
}

fn compute_id(header: &ObjectHeader) -> Result<ObjectId> {
    let encoded = bincode::serialize(header)?;
    Ok(ObjectId::from_bytes(Sha256::digest(&encoded).into()))
}

/// Builder for [`Object`]; the identifier is derived from the sealed header
#[derive(Debug)]
pub struct ObjectBuilder {
    container: ContainerId,
    owner: OwnerId,
    object_type: ObjectType,
    attributes: Vec<Attribute>,
    parent: Option<ObjectId>,
    members: Vec<ObjectId>,
    payload: Vec<u8>,
}

impl ObjectBuilder {
    /// Create a builder for a regular object with an empty payload
    #[must_use]
    pub const fn new(container: ContainerId, owner: OwnerId) -> Self {
        Self {
            container,
            owner,
            object_type: ObjectType::Regular,
            attributes: Vec::new(),
            parent: None,
            members: Vec::new(),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub const fn object_type(mut self, object_type: ObjectType) -> Self {
        self.object_type = object_type;
        self
    }

    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub const fn parent(mut self, parent: ObjectId) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn members(mut self, members: impl IntoIterator<Item = ObjectId>) -> Self {
        self.members.extend(members);
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Seal the header and compute the object identifier
    pub fn build(self) -> Result<Object> {
        let header = ObjectHeader {
            container: self.container,
            object_type: self.object_type,
            owner: self.owner,
            attributes: self.attributes,
            parent: self.parent,
            members: self.members,
            payload_length: self.payload.len() as u64,
            payload_checksum: Checksum::compute(&self.payload),
        };
        let id = compute_id(&header)?;
        Ok(Object {
            id,
            header,
            payload: self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_container() -> ContainerId {
        ContainerId::from_bytes(rand::random())
    }

    fn owner() -> OwnerId {
        OwnerId::from_bytes([7u8; OWNER_ID_SIZE])
    }

    #[test]
    fn test_address_string_roundtrip() {
        let addr = Address::new(random_container(), ObjectId::from_bytes(rand::random()));
        let s = addr.encode_to_string();

        assert_eq!(s.len(), Address::ENCODED_LEN);
        assert_eq!(Address::decode_str(&s).unwrap(), addr);
    }

    #[test]
    fn test_address_decode_rejects_garbage() {
        assert_eq!(
            Address::decode_str("abcdef"),
            Err(AddressError::MissingSeparator)
        );
        assert!(matches!(
            Address::decode_str("zz.zz"),
            Err(AddressError::InvalidHex(_))
        ));
        let err = Error::from(Address::decode_str("zz.zz").unwrap_err());
        assert!(matches!(err, Error::InvalidAddress(AddressError::InvalidHex(_))));
        assert!(matches!(
            Address::decode_str("abcd.abcd"),
            Err(AddressError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_address_key_layout() {
        let addr = Address::new(
            ContainerId::from_bytes([1u8; ID_SIZE]),
            ObjectId::from_bytes([2u8; ID_SIZE]),
        );
        let key = addr.to_key();

        assert_eq!(&key[..ID_SIZE], &[1u8; ID_SIZE]);
        assert_eq!(&key[ID_SIZE..], &[2u8; ID_SIZE]);
        assert_eq!(Address::from_key(&key).unwrap(), addr);
    }

    #[test]
    fn test_object_marshal_unmarshal() {
        let obj = Object::builder(random_container(), owner())
            .attribute(ATTRIBUTE_CONTENT_TYPE, "text/plain")
            .payload(b"some payload".to_vec())
            .build()
            .unwrap();

        let raw = obj.marshal().unwrap();
        let decoded = Object::unmarshal(&raw).unwrap();

        assert_eq!(decoded, obj);
        assert_eq!(decoded.header().content_type(), Some("text/plain"));
    }

    #[test]
    fn test_object_id_depends_on_payload() {
        let cnr = random_container();
        let a = Object::builder(cnr, owner()).payload(vec![1]).build().unwrap();
        let b = Object::builder(cnr, owner()).payload(vec![2]).build().unwrap();

        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_unmarshal_detects_tampered_payload() {
        let mut obj = Object::builder(random_container(), owner())
            .payload(vec![0u8; 64])
            .build()
            .unwrap();
        obj.payload[10] = 1;
        let raw = obj.marshal().unwrap();

        assert!(matches!(Object::unmarshal(&raw), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_unmarshal_detects_forged_sha256() {
        let mut obj = Object::builder(random_container(), owner())
            .payload(vec![5u8; 64])
            .build()
            .unwrap();
        // CRC still matches the payload, only the digest is wrong
        obj.header.payload_checksum.sha256[0] ^= 0xff;
        let raw = obj.marshal().unwrap();

        match Object::unmarshal(&raw) {
            Err(Error::Corrupted(msg)) => assert!(msg.contains("payload checksum")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_payload_range() {
        let obj = Object::builder(random_container(), owner())
            .payload(b"0123456789".to_vec())
            .build()
            .unwrap();

        assert_eq!(obj.payload_range(2, 3).unwrap(), b"234");
        assert_eq!(obj.payload_range(10, 0).unwrap(), b"");
        assert!(matches!(
            obj.payload_range(8, 3),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            obj.payload_range(11, 0),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            obj.payload_range(1, u64::MAX),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_expiration_epoch_attribute() {
        let obj = Object::builder(random_container(), owner())
            .attribute(ATTRIBUTE_EXPIRATION_EPOCH, "42")
            .build()
            .unwrap();
        assert_eq!(obj.header().expiration_epoch(), Some(42));

        let obj = Object::builder(random_container(), owner())
            .attribute(ATTRIBUTE_EXPIRATION_EPOCH, "never")
            .build()
            .unwrap();
        assert_eq!(obj.header().expiration_epoch(), None);
    }

    #[test]
    fn test_member_and_parent_addresses() {
        let cnr = random_container();
        let victim = ObjectId::from_bytes([9u8; ID_SIZE]);
        let ts = Object::builder(cnr, owner())
            .object_type(ObjectType::Tombstone)
            .members([victim])
            .build()
            .unwrap();
        assert_eq!(ts.member_addresses(), vec![Address::new(cnr, victim)]);

        let child = Object::builder(cnr, owner()).parent(victim).build().unwrap();
        assert_eq!(child.parent_address(), Some(Address::new(cnr, victim)));
    }
}
