//! Key model for licenses handed to the policy engine.
//!
//! Key material never reaches this crate; a license key here is its id plus
//! the usage rules the license attached to it.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::SecurityLevel;

/// Key identifier as carried in the license.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Vec<u8>);

impl KeyId {
    /// Wrap raw key id bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a key id from text.
    ///
    /// 32 hex digits (optionally dashed like a UUID) decode to 16 bytes; any
    /// other text is taken as the literal id bytes.
    pub fn parse(text: &str) -> Self {
        let compact: String = text.chars().filter(|c| *c != '-').collect();
        if compact.len() == 32 {
            if let Ok(bytes) = hex::decode(&compact) {
                return Self(bytes);
            }
        }
        Self(text.as_bytes().to_vec())
    }

    /// Raw key id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for KeyId {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for KeyId {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::parse(&text))
    }
}

/// Key container type. Names follow the license protocol enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyKind {
    Content,
    Entitlement,
    Signing,
    OperatorSession,
}

impl KeyKind {
    /// Content and entitlement keys take part in decryption decisions.
    pub fn is_content(self) -> bool {
        matches!(self, KeyKind::Content | KeyKind::Entitlement)
    }

    /// True for keys the policy engine tracks at all.
    pub fn is_tracked(self) -> bool {
        !matches!(self, KeyKind::Signing)
    }
}

/// Robustness level the license requires of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeySecurityLevel {
    SwSecureCrypto,
    SwSecureDecode,
    HwSecureCrypto,
    HwSecureDecode,
    HwSecureAll,
}

impl KeySecurityLevel {
    /// Whether a device running at `device` may use a key at this level.
    pub fn allowed_on(self, device: SecurityLevel) -> bool {
        match device {
            SecurityLevel::L1 => true,
            SecurityLevel::L2 | SecurityLevel::L3 => match self {
                KeySecurityLevel::SwSecureCrypto | KeySecurityLevel::SwSecureDecode => true,
                KeySecurityLevel::HwSecureCrypto => device == SecurityLevel::L2,
                KeySecurityLevel::HwSecureDecode | KeySecurityLevel::HwSecureAll => false,
            },
            SecurityLevel::Unknown => false,
        }
    }

    /// Hardware decode levels never release clear samples.
    pub fn requires_secure_buffer(self) -> bool {
        matches!(
            self,
            KeySecurityLevel::HwSecureDecode | KeySecurityLevel::HwSecureAll
        )
    }
}

/// Output protection level, as required by a key or reported by a device.
///
/// Ordered from weakest to strongest; `NoDigitalOutput` satisfies everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HdcpCapability {
    #[default]
    #[serde(rename = "HDCP_NONE")]
    None,
    #[serde(rename = "HDCP_V1")]
    V1,
    #[serde(rename = "HDCP_V2")]
    V2,
    #[serde(rename = "HDCP_V2_1")]
    V2_1,
    #[serde(rename = "HDCP_V2_2")]
    V2_2,
    #[serde(rename = "HDCP_V2_3")]
    V2_3,
    #[serde(rename = "HDCP_NO_DIGITAL_OUTPUT")]
    NoDigitalOutput,
}

impl HdcpCapability {
    /// Whether a device at this level satisfies `required`.
    pub fn satisfies(self, required: HdcpCapability) -> bool {
        self >= required
    }
}

/// Resolution band with its own output protection requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoResolutionConstraint {
    pub min_resolution_pixels: u32,
    pub max_resolution_pixels: u32,
    #[serde(default)]
    pub required_protection: Option<HdcpCapability>,
}

impl VideoResolutionConstraint {
    /// Whether `pixels` falls inside this band (inclusive).
    pub fn contains(&self, pixels: u32) -> bool {
        pixels >= self.min_resolution_pixels && pixels <= self.max_resolution_pixels
    }
}

/// Generic crypto permissions of an OPERATOR_SESSION key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorSessionPermissions {
    pub allow_encrypt: bool,
    pub allow_decrypt: bool,
    pub allow_sign: bool,
    pub allow_signature_verify: bool,
}

/// A key declared by a license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseKey {
    pub id: KeyId,
    #[serde(rename = "type")]
    pub kind: KeyKind,
    #[serde(default)]
    pub security_level: Option<KeySecurityLevel>,
    #[serde(default)]
    pub required_protection: Option<HdcpCapability>,
    #[serde(default)]
    pub video_resolution_constraints: Vec<VideoResolutionConstraint>,
    #[serde(default)]
    pub operator_session_permissions: Option<OperatorSessionPermissions>,
}

impl LicenseKey {
    /// A key of `kind` with no extra requirements.
    pub fn new(id: impl Into<KeyId>, kind: KeyKind) -> Self {
        Self {
            id: id.into(),
            kind,
            security_level: None,
            required_protection: None,
            video_resolution_constraints: Vec::new(),
            operator_session_permissions: None,
        }
    }

    /// Content key shorthand.
    pub fn content(id: impl Into<KeyId>) -> Self {
        Self::new(id, KeyKind::Content)
    }

    /// Entitlement key shorthand.
    pub fn entitlement(id: impl Into<KeyId>) -> Self {
        Self::new(id, KeyKind::Entitlement)
    }

    pub fn with_security_level(mut self, level: KeySecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }

    pub fn with_required_protection(mut self, hdcp: HdcpCapability) -> Self {
        self.required_protection = Some(hdcp);
        self
    }

    pub fn with_constraint(mut self, constraint: VideoResolutionConstraint) -> Self {
        self.video_resolution_constraints.push(constraint);
        self
    }

    pub fn with_permissions(mut self, permissions: OperatorSessionPermissions) -> Self {
        self.operator_session_permissions = Some(permissions);
        self
    }
}

/// Binding of a content key id to the entitlement key that wraps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitledKey {
    pub entitlement_key_id: KeyId,
    pub key_id: KeyId,
}

impl EntitledKey {
    pub fn new(entitlement_key_id: impl Into<KeyId>, key_id: impl Into<KeyId>) -> Self {
        Self {
            entitlement_key_id: entitlement_key_id.into(),
            key_id: key_id.into(),
        }
    }
}
