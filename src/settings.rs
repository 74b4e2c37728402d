use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

#[derive(Clone, Deserialize, Debug)]
pub struct WsServer {
	pub hostname: String,
	pub port: u16,
}

#[derive(Clone, Deserialize, Debug)]
pub struct RestServer {
	pub hostname: String,
	pub port: u16,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Database {
	pub path: PathBuf,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Helper {
	/// Path to the external MPC manager binary. An empty path disables
	/// supervision entirely.
	pub binary_path: PathBuf,
	pub log_dir: PathBuf,
	pub restart_backoff_secs: u64,
	pub auto_restart: bool,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Auth {
	/// File holding the JWT signing secret.
	pub jwt_secret_file: PathBuf,
	/// File holding the hex-encoded server ECDSA key used to mint
	/// SE-access capabilities during sign ceremonies.
	pub server_key_file: PathBuf,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Settings {
	pub ws: WsServer,
	pub rest: RestServer,
	pub database: Database,
	pub helper: Helper,
	pub auth: Auth,
}

#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about = "Coordination server for threshold-signature ceremonies")]
pub struct CommandLineOptions {
	/// Optional explicit settings file, merged over the built-in defaults.
	#[clap(long = "config", short = 'c')]
	pub config_file: Option<String>,
	#[clap(long = "ws.hostname")]
	ws_hostname: Option<String>,
	#[clap(long = "ws.port")]
	ws_port: Option<u16>,
	#[clap(long = "rest.hostname")]
	rest_hostname: Option<String>,
	#[clap(long = "rest.port")]
	rest_port: Option<u16>,
	#[clap(long = "database.path")]
	database_path: Option<String>,
	#[clap(long = "helper.binary_path")]
	helper_binary_path: Option<String>,
	#[clap(long = "helper.log_dir")]
	helper_log_dir: Option<String>,
	#[clap(long = "helper.restart_backoff_secs")]
	helper_restart_backoff_secs: Option<u64>,
	#[clap(long = "helper.auto_restart")]
	helper_auto_restart: Option<bool>,
	#[clap(long = "auth.jwt_secret_file")]
	jwt_secret_file: Option<String>,
	#[clap(long = "auth.server_key_file")]
	server_key_file: Option<String>,
}

pub fn insert_command_line_option<T>(map: &mut Map<String, Value>, key: &str, option: &Option<T>)
where
	T: Clone + Into<Value>,
{
	if let Some(value) = option {
		map.insert(key.to_string(), value.clone().into());
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> std::result::Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "ws.hostname", &self.ws_hostname);
		insert_command_line_option(&mut map, "ws.port", &self.ws_port.map(|port| port as i64));
		insert_command_line_option(&mut map, "rest.hostname", &self.rest_hostname);
		insert_command_line_option(&mut map, "rest.port", &self.rest_port.map(|port| port as i64));
		insert_command_line_option(&mut map, "database.path", &self.database_path);
		insert_command_line_option(&mut map, "helper.binary_path", &self.helper_binary_path);
		insert_command_line_option(&mut map, "helper.log_dir", &self.helper_log_dir);
		insert_command_line_option(
			&mut map,
			"helper.restart_backoff_secs",
			&self.helper_restart_backoff_secs.map(|secs| secs as i64),
		);
		insert_command_line_option(&mut map, "helper.auto_restart", &self.helper_auto_restart);
		insert_command_line_option(&mut map, "auth.jwt_secret_file", &self.jwt_secret_file);
		insert_command_line_option(&mut map, "auth.server_key_file", &self.server_key_file);

		Ok(map)
	}
}

impl Settings {
	pub fn load(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let mut builder = Self::set_defaults(Config::builder())?
			.add_source(File::with_name("config/default").required(false));

		if let Some(config_file) = &opts.config_file {
			builder = builder.add_source(File::with_name(config_file));
		}

		builder
			.add_source(Environment::default().separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()
	}

	fn set_defaults(
		config_builder: ConfigBuilder<config::builder::DefaultState>,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		// These defaults are for a localnet setup
		config_builder
			.set_default("ws.hostname", "0.0.0.0")?
			.set_default("ws.port", 8080)?
			.set_default("rest.hostname", "0.0.0.0")?
			.set_default("rest.port", 8081)?
			.set_default("database.path", "custody.db")?
			.set_default("helper.binary_path", "")?
			.set_default("helper.log_dir", "logs")?
			.set_default("helper.restart_backoff_secs", 5)?
			.set_default("helper.auto_restart", true)?
			.set_default("auth.jwt_secret_file", "keys/jwt.secret")?
			.set_default("auth.server_key_file", "keys/server.key")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn loads_defaults() {
		let settings = Settings::load(CommandLineOptions::default()).unwrap();
		assert_eq!(settings.ws.port, 8080);
		assert_eq!(settings.rest.port, 8081);
		assert!(settings.helper.auto_restart);
		assert_eq!(settings.helper.restart_backoff_secs, 5);
	}

	#[test]
	fn command_line_overrides_defaults() {
		let opts = CommandLineOptions {
			ws_port: Some(9000),
			database_path: Some("other.db".to_string()),
			helper_auto_restart: Some(false),
			..Default::default()
		};

		let settings = Settings::load(opts).unwrap();
		assert_eq!(settings.ws.port, 9000);
		assert_eq!(settings.database.path, PathBuf::from("other.db"));
		assert!(!settings.helper.auto_restart);
	}
}
