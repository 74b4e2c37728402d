use std::path::Path;

use anyhow::Context;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use secp256k1::{Message, Secp256k1, SecretKey, SignOnly};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::Role;

const BEARER_PREFIX: &str = "Bearer ";

/// Lifetime of a minted token in seconds.
const TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum AuthError {
	#[error("invalid token: {0}")]
	InvalidToken(#[from] jsonwebtoken::errors::Error),
	#[error("token identity does not match claimed identity")]
	IdentityMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
	pub sub: String,
	pub role: Role,
	pub exp: i64,
}

/// Mints and validates the JWTs used by both the REST surface and the
/// websocket `register` handshake.
pub struct TokenAuthority {
	encoding: EncodingKey,
	decoding: DecodingKey,
}

impl TokenAuthority {
	pub fn from_secret(secret: &[u8]) -> Self {
		TokenAuthority {
			encoding: EncodingKey::from_secret(secret),
			decoding: DecodingKey::from_secret(secret),
		}
	}

	pub fn from_file(path: &Path) -> anyhow::Result<Self> {
		let secret = std::fs::read_to_string(path)
			.with_context(|| format!("Could not read JWT secret from {}", path.display()))?;
		Ok(Self::from_secret(secret.trim().as_bytes()))
	}

	pub fn issue(&self, username: &str, role: Role) -> Result<String, AuthError> {
		let claims = Claims {
			sub: username.to_string(),
			role,
			exp: chrono::Utc::now().timestamp() + TOKEN_LIFETIME_SECS,
		};
		Ok(encode(&Header::default(), &claims, &self.encoding)?)
	}

	/// Validate a token, stripping the optional `Bearer ` prefix first.
	pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
		let token = token.strip_prefix(BEARER_PREFIX).unwrap_or(token);
		let data = decode::<Claims>(token, &self.decoding, &Validation::default())?;
		Ok(data.claims)
	}

	/// Validate a token and require that its claims match the identity the
	/// peer announced for itself.
	pub fn verify_identity(
		&self,
		token: &str,
		username: &str,
		role: Role,
	) -> Result<Claims, AuthError> {
		let claims = self.verify(token)?;
		if claims.sub != username || claims.role != role {
			return Err(AuthError::IdentityMismatch);
		}
		Ok(claims)
	}
}

/// Signs SE-access capabilities: an ECDSA signature over
/// `SHA256(username) || address_bytes` that a participant presents to its
/// local secure element to unseal the shard for a specific account.
pub struct CapabilitySigner {
	secp: Secp256k1<SignOnly>,
	key: SecretKey,
}

impl CapabilitySigner {
	pub fn new(key: SecretKey) -> Self {
		CapabilitySigner { secp: Secp256k1::signing_only(), key }
	}

	/// Load a hex-encoded 32 byte key from disk.
	pub fn from_file(path: &Path) -> anyhow::Result<Self> {
		let encoded = std::fs::read_to_string(path)
			.with_context(|| format!("Could not read server key from {}", path.display()))?;
		let bytes = hex::decode(encoded.trim()).context("Server key is not valid hex")?;
		let key = SecretKey::from_slice(&bytes).context("Server key is not a valid ECDSA key")?;
		Ok(Self::new(key))
	}

	/// Authorize `username` to use its shard for `address`. Returns the
	/// DER signature hex-encoded.
	pub fn authorize(&self, username: &str, address: &str) -> anyhow::Result<String> {
		let mut payload = Vec::with_capacity(32 + 20);
		payload.extend_from_slice(&Sha256::digest(username.as_bytes()));
		payload.extend_from_slice(&address_bytes(address)?);

		let digest: [u8; 32] = Sha256::digest(&payload).into();
		let message = Message::from_slice(&digest).expect("digest is 32 bytes");
		Ok(hex::encode(self.secp.sign_ecdsa(&message, &self.key).serialize_der()))
	}
}

/// Decode an account address, accepting the conventional `0x` prefix.
pub fn address_bytes(address: &str) -> anyhow::Result<Vec<u8>> {
	let stripped = address.strip_prefix("0x").unwrap_or(address);
	hex::decode(stripped).with_context(|| format!("Invalid account address: {address}"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use secp256k1::PublicKey;

	fn authority() -> TokenAuthority {
		TokenAuthority::from_secret(b"test-secret")
	}

	#[test]
	fn tokens_round_trip() {
		let authority = authority();
		let token = authority.issue("u1", Role::Participant).unwrap();

		let claims = authority.verify(&token).unwrap();
		assert_eq!(claims.sub, "u1");
		assert_eq!(claims.role, Role::Participant);

		// The Bearer prefix is optional
		let claims = authority.verify(&format!("Bearer {token}")).unwrap();
		assert_eq!(claims.sub, "u1");
	}

	#[test]
	fn rejects_foreign_tokens() {
		let token = authority().issue("u1", Role::Participant).unwrap();
		assert!(TokenAuthority::from_secret(b"other-secret").verify(&token).is_err());
	}

	#[test]
	fn rejects_identity_mismatch() {
		let authority = authority();
		let token = authority.issue("u1", Role::Participant).unwrap();

		assert!(authority.verify_identity(&token, "u1", Role::Participant).is_ok());
		assert!(matches!(
			authority.verify_identity(&token, "u2", Role::Participant),
			Err(AuthError::IdentityMismatch)
		));
		assert!(matches!(
			authority.verify_identity(&token, "u1", Role::Admin),
			Err(AuthError::IdentityMismatch)
		));
	}

	#[test]
	fn capability_signatures_verify() {
		let key = SecretKey::new(&mut rand::thread_rng());
		let signer = CapabilitySigner::new(key);

		let signature = signer.authorize("u1", "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
		let der = hex::decode(signature).unwrap();

		let mut payload = Vec::new();
		payload.extend_from_slice(&Sha256::digest(b"u1"));
		payload.extend_from_slice(&[0xAA; 20]);
		let digest: [u8; 32] = Sha256::digest(&payload).into();

		let secp = Secp256k1::new();
		let message = Message::from_slice(&digest).unwrap();
		let signature = secp256k1::ecdsa::Signature::from_der(&der).unwrap();
		assert!(secp
			.verify_ecdsa(&message, &signature, &PublicKey::from_secret_key(&secp, &key))
			.is_ok());
	}

	#[test]
	fn rejects_malformed_addresses() {
		assert!(address_bytes("0x12zz").is_err());
		assert_eq!(address_bytes("0x1234").unwrap(), vec![0x12, 0x34]);
		assert_eq!(address_bytes("1234").unwrap(), vec![0x12, 0x34]);
	}
}
