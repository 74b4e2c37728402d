use std::{path::Path, sync::Mutex};

use rand::seq::SliceRandom;
use rusqlite::{params, Connection};

use super::{
	EncryptedShard, KeyGenRecord, Repository, RepositoryError, Result, Role, SecureElement,
	SessionStatus, SignRecord, SlotState, User,
};

/// The one concrete [`Repository`] implementation: a single SQLite
/// connection behind a mutex. Slot arrays are stored as JSON text columns.
pub struct SqliteRepository {
	connection: Mutex<Connection>,
}

impl SqliteRepository {
	pub fn open(path: &Path) -> Result<Self> {
		let connection = Connection::open(path)
			.map_err(|e| RepositoryError::OperationFailed(e.to_string()))?;
		Self::new(connection)
	}

	pub fn open_in_memory() -> Result<Self> {
		let connection = Connection::open_in_memory()
			.map_err(|e| RepositoryError::OperationFailed(e.to_string()))?;
		Self::new(connection)
	}

	fn new(connection: Connection) -> Result<Self> {
		migrate(&connection)?;
		Ok(SqliteRepository { connection: Mutex::new(connection) })
	}

	fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
		let connection = self.connection.lock().map_err(|_| RepositoryError::NotInitialized)?;
		f(&connection)
	}
}

fn migrate(connection: &Connection) -> Result<()> {
	connection.execute_batch(
		"CREATE TABLE IF NOT EXISTS users (
			username TEXT PRIMARY KEY,
			password_hash TEXT NOT NULL,
			email TEXT NOT NULL,
			role TEXT NOT NULL
		);
		CREATE TABLE IF NOT EXISTS secure_elements (
			se_id TEXT PRIMARY KEY,
			cpic TEXT NOT NULL UNIQUE
		);
		CREATE TABLE IF NOT EXISTS ethereum_key_shards (
			username TEXT NOT NULL,
			account_address TEXT NOT NULL,
			shard_index INTEGER NOT NULL,
			cpic TEXT NOT NULL,
			ciphertext TEXT NOT NULL,
			UNIQUE (username, account_address),
			UNIQUE (account_address, shard_index)
		);
		CREATE TABLE IF NOT EXISTS key_gen_sessions (
			session_key TEXT PRIMARY KEY,
			initiator TEXT NOT NULL,
			threshold INTEGER NOT NULL,
			total_parts INTEGER NOT NULL,
			participants TEXT NOT NULL,
			responses TEXT NOT NULL,
			chips TEXT NOT NULL,
			account_address TEXT,
			status TEXT NOT NULL
		);
		CREATE TABLE IF NOT EXISTS sign_sessions (
			session_key TEXT PRIMARY KEY,
			initiator TEXT NOT NULL,
			data TEXT NOT NULL,
			account_address TEXT NOT NULL,
			threshold INTEGER NOT NULL,
			total_parts INTEGER NOT NULL,
			participants TEXT NOT NULL,
			responses TEXT NOT NULL,
			chips TEXT NOT NULL,
			signature TEXT,
			status TEXT NOT NULL
		);",
	)?;
	Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
	serde_json::to_string(value).map_err(|e| RepositoryError::OperationFailed(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
	serde_json::from_str(text).map_err(|e| RepositoryError::OperationFailed(e.to_string()))
}

impl Repository for SqliteRepository {
	fn create_user(&self, user: &User) -> Result<()> {
		if user.username.is_empty() {
			return Err(RepositoryError::InvalidParameter("empty username".to_string()));
		}
		self.with_connection(|connection| {
			connection.execute(
				"INSERT INTO users (username, password_hash, email, role) VALUES (?1, ?2, ?3, ?4)",
				params![user.username, user.password_hash, user.email, user.role.to_string()],
			)?;
			Ok(())
		})
	}

	fn user_by_credentials(&self, username: &str, password_hash: &str) -> Result<User> {
		self.with_connection(|connection| {
			let (username, password_hash, email, role): (String, String, String, String) =
				connection.query_row(
					"SELECT username, password_hash, email, role FROM users
					WHERE username = ?1 AND password_hash = ?2",
					params![username, password_hash],
					|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
				)?;
			Ok(User { username, password_hash, email, role: role.parse()? })
		})
	}

	fn user_by_username(&self, username: &str) -> Result<User> {
		self.with_connection(|connection| {
			let (username, password_hash, email, role): (String, String, String, String) =
				connection.query_row(
					"SELECT username, password_hash, email, role FROM users WHERE username = ?1",
					params![username],
					|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
				)?;
			Ok(User { username, password_hash, email, role: role.parse()? })
		})
	}

	fn list_users(&self) -> Result<Vec<User>> {
		self.with_connection(|connection| {
			let mut statement = connection
				.prepare("SELECT username, password_hash, email, role FROM users ORDER BY username")?;
			let rows = statement.query_map([], |row| {
				Ok((
					row.get::<_, String>(0)?,
					row.get::<_, String>(1)?,
					row.get::<_, String>(2)?,
					row.get::<_, String>(3)?,
				))
			})?;

			let mut users = Vec::new();
			for row in rows {
				let (username, password_hash, email, role) = row?;
				users.push(User { username, password_hash, email, role: role.parse()? });
			}
			Ok(users)
		})
	}

	fn update_role(&self, username: &str, role: Role) -> Result<()> {
		self.with_connection(|connection| {
			let updated = connection.execute(
				"UPDATE users SET role = ?2 WHERE username = ?1",
				params![username, role.to_string()],
			)?;
			if updated == 0 {
				return Err(RepositoryError::NotFound);
			}
			Ok(())
		})
	}

	fn create_se(&self, se: &SecureElement) -> Result<()> {
		if se.se_id.is_empty() || se.cpic.is_empty() {
			return Err(RepositoryError::InvalidParameter("empty se_id or cpic".to_string()));
		}
		self.with_connection(|connection| {
			connection.execute(
				"INSERT INTO secure_elements (se_id, cpic) VALUES (?1, ?2)",
				params![se.se_id, se.cpic],
			)?;
			Ok(())
		})
	}

	fn se_by_id(&self, se_id: &str) -> Result<SecureElement> {
		self.with_connection(|connection| {
			Ok(connection.query_row(
				"SELECT se_id, cpic FROM secure_elements WHERE se_id = ?1",
				params![se_id],
				|row| Ok(SecureElement { se_id: row.get(0)?, cpic: row.get(1)? }),
			)?)
		})
	}

	fn se_by_cpic(&self, cpic: &str) -> Result<SecureElement> {
		self.with_connection(|connection| {
			Ok(connection.query_row(
				"SELECT se_id, cpic FROM secure_elements WHERE cpic = ?1",
				params![cpic],
				|row| Ok(SecureElement { se_id: row.get(0)?, cpic: row.get(1)? }),
			)?)
		})
	}

	fn list_se(&self) -> Result<Vec<SecureElement>> {
		self.with_connection(|connection| {
			let mut statement =
				connection.prepare("SELECT se_id, cpic FROM secure_elements ORDER BY se_id")?;
			let rows = statement.query_map([], |row| {
				Ok(SecureElement { se_id: row.get(0)?, cpic: row.get(1)? })
			})?;
			Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
		})
	}

	fn random_se_ids(&self, k: usize) -> Result<Vec<String>> {
		if k == 0 {
			return Err(RepositoryError::InvalidParameter("k must be positive".to_string()));
		}
		let mut ids = self.with_connection(|connection| {
			let mut statement = connection.prepare("SELECT se_id FROM secure_elements")?;
			let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
			Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
		})?;
		if ids.is_empty() {
			return Err(RepositoryError::NotFound);
		}

		ids.shuffle(&mut rand::thread_rng());
		Ok((0..k).map(|i| ids[i % ids.len()].clone()).collect())
	}

	fn save_shard(&self, shard: &EncryptedShard) -> Result<()> {
		if shard.ciphertext.is_empty() {
			return Err(RepositoryError::InvalidParameter("empty ciphertext".to_string()));
		}
		self.with_connection(|connection| {
			connection.execute(
				"INSERT INTO ethereum_key_shards
					(username, account_address, shard_index, cpic, ciphertext)
				VALUES (?1, ?2, ?3, ?4, ?5)",
				params![
					shard.username,
					shard.account_address,
					shard.shard_index,
					shard.cpic,
					shard.ciphertext
				],
			)?;
			Ok(())
		})
	}

	fn shard(&self, username: &str, account_address: &str) -> Result<EncryptedShard> {
		self.with_connection(|connection| {
			Ok(connection.query_row(
				"SELECT username, account_address, shard_index, cpic, ciphertext
				FROM ethereum_key_shards WHERE username = ?1 AND account_address = ?2",
				params![username, account_address],
				|row| {
					Ok(EncryptedShard {
						username: row.get(0)?,
						account_address: row.get(1)?,
						shard_index: row.get(2)?,
						cpic: row.get(3)?,
						ciphertext: row.get(4)?,
					})
				},
			)?)
		})
	}

	fn upsert_keygen(&self, record: &KeyGenRecord) -> Result<()> {
		let participants = to_json(&record.participants)?;
		let responses = to_json(&record.responses)?;
		let chips = to_json(&record.chips)?;
		let status = record.status.to_string();
		self.with_connection(|connection| {
			connection.execute(
				"INSERT OR REPLACE INTO key_gen_sessions
					(session_key, initiator, threshold, total_parts,
					 participants, responses, chips, account_address, status)
				VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
				params![
					record.session_key,
					record.initiator,
					record.threshold,
					record.total_parts,
					participants,
					responses,
					chips,
					record.account_address,
					status
				],
			)?;
			Ok(())
		})
	}

	fn keygen(&self, session_key: &str) -> Result<KeyGenRecord> {
		let raw = self.with_connection(|connection| {
			Ok(connection.query_row(
				"SELECT session_key, initiator, threshold, total_parts,
					participants, responses, chips, account_address, status
				FROM key_gen_sessions WHERE session_key = ?1",
				params![session_key],
				|row| {
					Ok((
						row.get::<_, String>(0)?,
						row.get::<_, String>(1)?,
						row.get::<_, u32>(2)?,
						row.get::<_, u32>(3)?,
						row.get::<_, String>(4)?,
						row.get::<_, String>(5)?,
						row.get::<_, String>(6)?,
						row.get::<_, Option<String>>(7)?,
						row.get::<_, String>(8)?,
					))
				},
			)?)
		})?;

		let (session_key, initiator, threshold, total_parts, participants, responses, chips, account_address, status) =
			raw;
		Ok(KeyGenRecord {
			session_key,
			initiator,
			threshold,
			total_parts,
			participants: from_json::<Vec<String>>(&participants)?,
			responses: from_json::<Vec<SlotState>>(&responses)?,
			chips: from_json::<Vec<String>>(&chips)?,
			account_address,
			status: status.parse()?,
		})
	}

	fn keygen_by_address(&self, account_address: &str) -> Result<KeyGenRecord> {
		let session_key = self.with_connection(|connection| {
			Ok(connection.query_row(
				"SELECT session_key FROM key_gen_sessions WHERE account_address = ?1",
				params![account_address],
				|row| row.get::<_, String>(0),
			)?)
		})?;
		self.keygen(&session_key)
	}

	fn delete_keygen(&self, session_key: &str) -> Result<()> {
		self.with_connection(|connection| {
			let deleted = connection.execute(
				"DELETE FROM key_gen_sessions WHERE session_key = ?1",
				params![session_key],
			)?;
			if deleted == 0 {
				return Err(RepositoryError::NotFound);
			}
			Ok(())
		})
	}

	fn upsert_sign(&self, record: &SignRecord) -> Result<()> {
		let participants = to_json(&record.participants)?;
		let responses = to_json(&record.responses)?;
		let chips = to_json(&record.chips)?;
		let status = record.status.to_string();
		self.with_connection(|connection| {
			connection.execute(
				"INSERT OR REPLACE INTO sign_sessions
					(session_key, initiator, data, account_address, threshold, total_parts,
					 participants, responses, chips, signature, status)
				VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
				params![
					record.session_key,
					record.initiator,
					record.data,
					record.account_address,
					record.threshold,
					record.total_parts,
					participants,
					responses,
					chips,
					record.signature,
					status
				],
			)?;
			Ok(())
		})
	}

	fn sign_session(&self, session_key: &str) -> Result<SignRecord> {
		let raw = self.with_connection(|connection| {
			Ok(connection.query_row(
				"SELECT session_key, initiator, data, account_address, threshold, total_parts,
					participants, responses, chips, signature, status
				FROM sign_sessions WHERE session_key = ?1",
				params![session_key],
				|row| {
					Ok((
						row.get::<_, String>(0)?,
						row.get::<_, String>(1)?,
						row.get::<_, String>(2)?,
						row.get::<_, String>(3)?,
						row.get::<_, u32>(4)?,
						row.get::<_, u32>(5)?,
						row.get::<_, String>(6)?,
						row.get::<_, String>(7)?,
						row.get::<_, String>(8)?,
						row.get::<_, Option<String>>(9)?,
						row.get::<_, String>(10)?,
					))
				},
			)?)
		})?;

		let (session_key, initiator, data, account_address, threshold, total_parts, participants, responses, chips, signature, status) =
			raw;
		Ok(SignRecord {
			session_key,
			initiator,
			data,
			account_address,
			threshold,
			total_parts,
			participants: from_json::<Vec<String>>(&participants)?,
			responses: from_json::<Vec<SlotState>>(&responses)?,
			chips: from_json::<Vec<String>>(&chips)?,
			signature,
			status: status.parse()?,
		})
	}

	fn delete_sign(&self, session_key: &str) -> Result<()> {
		self.with_connection(|connection| {
			let deleted = connection
				.execute("DELETE FROM sign_sessions WHERE session_key = ?1", params![session_key])?;
			if deleted == 0 {
				return Err(RepositoryError::NotFound);
			}
			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn setup() -> SqliteRepository {
		SqliteRepository::open_in_memory().expect("Failed to open in-memory database")
	}

	fn user(name: &str, role: Role) -> User {
		User {
			username: name.to_string(),
			password_hash: format!("hash-{name}"),
			email: format!("{name}@example.com"),
			role,
		}
	}

	#[test]
	fn creates_and_fetches_users() {
		let repository = setup();
		repository.create_user(&user("u1", Role::Guest)).unwrap();

		let fetched = repository.user_by_username("u1").unwrap();
		assert_eq!(fetched.role, Role::Guest);
		assert_eq!(fetched.email, "u1@example.com");

		assert!(matches!(
			repository.user_by_username("nobody"),
			Err(RepositoryError::NotFound)
		));
	}

	#[test]
	fn rejects_duplicate_usernames() {
		let repository = setup();
		repository.create_user(&user("u1", Role::Guest)).unwrap();
		assert!(matches!(
			repository.create_user(&user("u1", Role::Admin)),
			Err(RepositoryError::AlreadyExists)
		));
	}

	#[test]
	fn checks_credentials() {
		let repository = setup();
		repository.create_user(&user("u1", Role::Participant)).unwrap();

		assert!(repository.user_by_credentials("u1", "hash-u1").is_ok());
		assert!(matches!(
			repository.user_by_credentials("u1", "wrong"),
			Err(RepositoryError::NotFound)
		));
	}

	#[test]
	fn updates_roles() {
		let repository = setup();
		repository.create_user(&user("u1", Role::Guest)).unwrap();
		repository.update_role("u1", Role::Coordinator).unwrap();
		assert_eq!(repository.user_by_username("u1").unwrap().role, Role::Coordinator);

		assert!(matches!(
			repository.update_role("nobody", Role::Guest),
			Err(RepositoryError::NotFound)
		));
	}

	#[test]
	fn registers_secure_elements() {
		let repository = setup();
		let se = SecureElement { se_id: "SE000".to_string(), cpic: "cpic0".to_string() };
		repository.create_se(&se).unwrap();

		assert_eq!(repository.se_by_id("SE000").unwrap(), se);
		assert_eq!(repository.se_by_cpic("cpic0").unwrap(), se);

		// Both the sticker id and the device identifier are unique
		assert!(matches!(
			repository.create_se(&SecureElement {
				se_id: "SE000".to_string(),
				cpic: "other".to_string()
			}),
			Err(RepositoryError::AlreadyExists)
		));
		assert!(matches!(
			repository.create_se(&SecureElement {
				se_id: "SE001".to_string(),
				cpic: "cpic0".to_string()
			}),
			Err(RepositoryError::AlreadyExists)
		));
	}

	#[test]
	fn random_se_ids_are_distinct_when_possible() {
		let repository = setup();
		for i in 0..5 {
			repository
				.create_se(&SecureElement {
					se_id: format!("SE00{i}"),
					cpic: format!("cpic{i}"),
				})
				.unwrap();
		}

		let ids = repository.random_se_ids(3).unwrap();
		assert_eq!(ids.len(), 3);
		let mut deduped = ids.clone();
		deduped.sort();
		deduped.dedup();
		assert_eq!(deduped.len(), 3);
	}

	#[test]
	fn random_se_ids_cycle_when_registry_is_small() {
		let repository = setup();
		repository
			.create_se(&SecureElement { se_id: "SE000".to_string(), cpic: "cpic0".to_string() })
			.unwrap();

		let ids = repository.random_se_ids(3).unwrap();
		assert_eq!(ids, vec!["SE000", "SE000", "SE000"]);

		assert!(matches!(setup().random_se_ids(1), Err(RepositoryError::NotFound)));
	}

	fn shard(username: &str, address: &str, index: u32) -> EncryptedShard {
		EncryptedShard {
			username: username.to_string(),
			account_address: address.to_string(),
			shard_index: index,
			cpic: format!("cpic-{username}"),
			ciphertext: format!("b64<{username}>"),
		}
	}

	#[test]
	fn stores_shards_once_per_user_and_slot() {
		let repository = setup();
		repository.save_shard(&shard("u1", "0xAAA", 1)).unwrap();
		repository.save_shard(&shard("u2", "0xAAA", 2)).unwrap();

		assert_eq!(repository.shard("u1", "0xAAA").unwrap().shard_index, 1);

		// Same user, same account
		assert!(matches!(
			repository.save_shard(&shard("u1", "0xAAA", 3)),
			Err(RepositoryError::AlreadyExists)
		));
		// Different user, same slot
		assert!(matches!(
			repository.save_shard(&shard("u3", "0xAAA", 2)),
			Err(RepositoryError::AlreadyExists)
		));
		// Same user, different account is fine
		repository.save_shard(&shard("u1", "0xBBB", 1)).unwrap();
	}

	fn keygen_record(session_key: &str) -> KeyGenRecord {
		KeyGenRecord {
			session_key: session_key.to_string(),
			initiator: "admin".to_string(),
			threshold: 2,
			total_parts: 3,
			participants: vec!["u1".to_string(), "u2".to_string(), "u3".to_string()],
			responses: vec![SlotState::Init; 3],
			chips: vec!["SE000".to_string(), "SE001".to_string(), "SE002".to_string()],
			account_address: None,
			status: SessionStatus::Created,
		}
	}

	#[test]
	fn keygen_sessions_round_trip() {
		let repository = setup();
		let mut record = keygen_record("kg1");
		repository.upsert_keygen(&record).unwrap();
		assert_eq!(repository.keygen("kg1").unwrap(), record);

		record.status = SessionStatus::Completed;
		record.account_address = Some("0xAAA".to_string());
		record.responses = vec![SlotState::Completed; 3];
		repository.upsert_keygen(&record).unwrap();

		assert_eq!(repository.keygen("kg1").unwrap(), record);
		assert_eq!(repository.keygen_by_address("0xAAA").unwrap(), record);

		repository.delete_keygen("kg1").unwrap();
		assert!(matches!(repository.keygen("kg1"), Err(RepositoryError::NotFound)));
	}

	#[test]
	fn sign_sessions_round_trip() {
		let repository = setup();
		let mut record = SignRecord {
			session_key: "s1".to_string(),
			initiator: "admin".to_string(),
			data: "0x1234".to_string(),
			account_address: "0xAAA".to_string(),
			threshold: 2,
			total_parts: 2,
			participants: vec!["u1".to_string(), "u2".to_string()],
			responses: vec![SlotState::Init; 2],
			chips: vec!["SE000".to_string(), "SE001".to_string()],
			signature: None,
			status: SessionStatus::Created,
		};
		repository.upsert_sign(&record).unwrap();
		assert_eq!(repository.sign_session("s1").unwrap(), record);

		record.signature = Some("0xSIG".to_string());
		record.status = SessionStatus::Completed;
		repository.upsert_sign(&record).unwrap();
		assert_eq!(repository.sign_session("s1").unwrap(), record);

		repository.delete_sign("s1").unwrap();
		assert!(matches!(repository.sign_session("s1"), Err(RepositoryError::NotFound)));
	}
}
