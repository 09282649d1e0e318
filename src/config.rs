use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        BoolishValueParser, ValueParser,
    },
    Arg, ArgAction, ArgMatches, ColorChoice, Command,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use warp::http::Uri;

use crate::{
    auth::AuthConfig,
    error::AuthError,
    hasher::PasswordHasher,
    store::{InMemoryUserDatabase, SqliteUserDatabase, UserDatabase},
};

/// One year.
const MAX_TOKEN_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

/// Where accounts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// A SQLite file every worker opens.
    Sqlite(PathBuf),
    /// Process-local; only valid with a single worker.
    InMemory,
}

#[derive(Debug)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub jwt_secret: SecretString,
    pub token_issuer: String,
    pub token_lifetime: Duration,
    pub store: StoreConfig,
    pub workers: usize,
    pub respawn: bool,
    pub allowed_origin: String,
    pub hasher: PasswordHasher,
    pub verbosity: u8,
    /// Set on processes started by the supervisor.
    pub worker_id: Option<usize>,
}

impl ServerConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let store = if matches.get_flag("in-memory") {
            StoreConfig::InMemory
        } else {
            StoreConfig::Sqlite(
                matches
                    .get_one::<PathBuf>("database")
                    .cloned()
                    .ok_or_else(|| anyhow!("missing required argument: --database"))?,
            )
        };

        let workers = match matches.get_one::<u64>("workers") {
            Some(workers) => usize::try_from(*workers)?,
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };

        let config = Self {
            host: matches
                .get_one::<IpAddr>("host")
                .copied()
                .ok_or_else(|| anyhow!("missing required argument: --host"))?,
            port: matches.get_one::<u16>("port").copied().unwrap_or(5000),
            jwt_secret: matches
                .get_one::<String>("jwt-secret")
                .map(|s| SecretString::from(s.clone()))
                .ok_or_else(|| anyhow!("missing required argument: --jwt-secret"))?,
            token_issuer: matches
                .get_one::<String>("token-issuer")
                .cloned()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            token_lifetime: Duration::from_secs(
                matches
                    .get_one::<u64>("token-lifetime")
                    .copied()
                    .unwrap_or(3600),
            ),
            store,
            workers,
            respawn: matches.get_flag("respawn"),
            allowed_origin: matches
                .get_one::<String>("allowed-origin")
                .cloned()
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            hasher: PasswordHasher::new(
                matches.get_one::<u32>("hash-time-cost").copied().unwrap_or(3),
                matches.get_one::<u32>("hash-mem-cost").copied().unwrap_or(4096),
            ),
            verbosity: matches.get_one::<u8>("verbosity").copied().unwrap_or(0),
            worker_id: matches.get_one::<usize>("worker-id").copied(),
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers > 1 && self.store == StoreConfig::InMemory {
            bail!(
                "an in-memory store cannot be shared between {} workers; use --database or --workers 1",
                self.workers
            );
        }

        if self.workers > 1 && !cfg!(unix) {
            bail!("multiple workers need SO_REUSEPORT, which this platform lacks; use --workers 1");
        }

        if self.jwt_secret.expose_secret().is_empty() {
            bail!("the JWT secret must not be empty");
        }

        Ok(())
    }

    /// Open the configured store and assemble the auth settings for one worker.
    pub fn auth_config(&self) -> Result<AuthConfig, AuthError> {
        let database_connection: Arc<Mutex<dyn UserDatabase>> = match &self.store {
            StoreConfig::Sqlite(path) => Arc::new(Mutex::new(SqliteUserDatabase::open(path)?)),
            StoreConfig::InMemory => Arc::new(Mutex::new(InMemoryUserDatabase::new())),
        };

        Ok(AuthConfig {
            auth_token_issuer: self.token_issuer.clone(),
            auth_token_secret: self.jwt_secret.expose_secret().to_string(),
            auth_token_lifetime: self.token_lifetime,
            password_hasher: self.hasher,
            database_connection,
        })
    }
}

pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 4 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

fn validator_origin() -> ValueParser {
    ValueParser::from(move |origin: &str| -> std::result::Result<String, String> {
        let uri: Uri = origin
            .parse()
            .map_err(|e| format!("invalid origin: {e}"))?;

        match (uri.scheme(), uri.authority(), uri.path()) {
            (Some(_), Some(_), "" | "/") => Ok(origin.trim_end_matches('/').to_string()),
            _ => Err("origin must look like scheme://host[:port]".to_string()),
        }
    })
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("auth-server")
        .about("Account registration, login and bearer-token sessions")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("5000")
                .env("PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .help("Address to bind")
                .default_value("0.0.0.0")
                .env("AUTH_HOST")
                .value_parser(clap::value_parser!(IpAddr)),
        )
        .arg(
            Arg::new("jwt-secret")
                .long("jwt-secret")
                .help("Secret used to sign session tokens; must be identical for every worker")
                .env("JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("token-issuer")
                .long("token-issuer")
                .help("Issuer claim written into and required of every token")
                .default_value(env!("CARGO_PKG_NAME"))
                .env("AUTH_TOKEN_ISSUER"),
        )
        .arg(
            Arg::new("token-lifetime")
                .long("token-lifetime")
                .help("Token lifetime in seconds, at most one year")
                .default_value("3600")
                .env("AUTH_TOKEN_LIFETIME")
                .value_parser(clap::value_parser!(u64).range(1..=MAX_TOKEN_LIFETIME_SECS)),
        )
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .help("SQLite file holding accounts, shared by all workers")
                .default_value("auth.db")
                .env("AUTH_DATABASE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("in-memory")
                .long("in-memory")
                .help("Keep accounts in process memory (single worker only, lost on exit)")
                .env("AUTH_IN_MEMORY")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .help("Number of worker processes [default: one per core]")
                .env("AUTH_WORKERS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("respawn")
                .long("respawn")
                .help("Restart workers that exit")
                .env("AUTH_RESPAWN")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new("allowed-origin")
                .long("allowed-origin")
                .help("Origin allowed by CORS")
                .default_value("http://localhost:3000")
                .env("AUTH_ALLOWED_ORIGIN")
                .value_parser(validator_origin()),
        )
        .arg(
            Arg::new("hash-time-cost")
                .long("hash-time-cost")
                .help("argon2 iterations per password hash")
                .default_value("3")
                .env("AUTH_HASH_TIME_COST")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("hash-mem-cost")
                .long("hash-mem-cost")
                .help("argon2 memory per password hash, in KiB")
                .default_value("4096")
                .env("AUTH_HASH_MEM_COST")
                .value_parser(clap::value_parser!(u32).range(8..)),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .hide(true)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("AUTH_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(validator_log_level()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN_ENV: [(&str, Option<&str>); 13] = [
        ("PORT", None),
        ("AUTH_HOST", None),
        ("JWT_SECRET", None),
        ("AUTH_TOKEN_ISSUER", None),
        ("AUTH_TOKEN_LIFETIME", None),
        ("AUTH_DATABASE", None),
        ("AUTH_IN_MEMORY", None),
        ("AUTH_WORKERS", None),
        ("AUTH_RESPAWN", None),
        ("AUTH_ALLOWED_ORIGIN", None),
        ("AUTH_HASH_TIME_COST", None),
        ("AUTH_HASH_MEM_COST", None),
        ("AUTH_LOG_LEVEL", None),
    ];

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let matches = new().try_get_matches_from(args)?;
        ServerConfig::from_matches(&matches)
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "auth-server");
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_defaults() {
        temp_env::with_vars(CLEAN_ENV, || {
            let config = parse(&["auth-server", "--jwt-secret", "s3cret", "-w", "2"]).unwrap();

            assert_eq!(config.port, 5000);
            assert_eq!(config.host.to_string(), "0.0.0.0");
            assert_eq!(config.jwt_secret.expose_secret(), "s3cret");
            assert_eq!(config.token_issuer, env!("CARGO_PKG_NAME"));
            assert_eq!(config.token_lifetime, Duration::from_secs(3600));
            assert_eq!(config.store, StoreConfig::Sqlite(PathBuf::from("auth.db")));
            assert_eq!(config.workers, 2);
            assert!(!config.respawn);
            assert_eq!(config.allowed_origin, "http://localhost:3000");
            assert_eq!(config.hasher.time_cost, 3);
            assert_eq!(config.hasher.mem_cost, 4096);
            assert_eq!(config.verbosity, 0);
            assert_eq!(config.worker_id, None);
        });
    }

    #[test]
    fn test_jwt_secret_is_required() {
        temp_env::with_vars(CLEAN_ENV, || {
            assert!(parse(&["auth-server"]).is_err());
        });
    }

    #[test]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("PORT", Some("8443")),
                ("JWT_SECRET", Some("from-env")),
                ("AUTH_TOKEN_LIFETIME", Some("60")),
                ("AUTH_DATABASE", Some("/var/lib/auth/accounts.db")),
                ("AUTH_WORKERS", Some("4")),
                ("AUTH_RESPAWN", Some("true")),
                ("AUTH_ALLOWED_ORIGIN", Some("https://app.example.com")),
                ("AUTH_LOG_LEVEL", Some("info")),
            ],
            || {
                let config = parse(&["auth-server"]).unwrap();

                assert_eq!(config.port, 8443);
                assert_eq!(config.jwt_secret.expose_secret(), "from-env");
                assert_eq!(config.token_lifetime, Duration::from_secs(60));
                assert_eq!(
                    config.store,
                    StoreConfig::Sqlite(PathBuf::from("/var/lib/auth/accounts.db"))
                );
                assert_eq!(config.workers, 4);
                assert!(config.respawn);
                assert_eq!(config.allowed_origin, "https://app.example.com");
                assert_eq!(config.verbosity, 2);
            },
        );
    }

    #[test]
    fn test_check_log_level_verbosity() {
        let levels = ["error", "warn", "info", "debug", "trace"];
        for (index, _) in levels.iter().enumerate() {
            temp_env::with_vars(CLEAN_ENV, || {
                let mut args = vec!["auth-server", "--jwt-secret", "s3cret", "-w", "1"];
                let flag = format!("-{}", "v".repeat(index));
                if index > 0 {
                    args.push(&flag);
                }

                let config = parse(&args).unwrap();
                assert_eq!(config.verbosity, index as u8);
            });
        }
    }

    #[test]
    fn test_in_memory_store_needs_a_single_worker() {
        temp_env::with_vars(CLEAN_ENV, || {
            let err = parse(&["auth-server", "--jwt-secret", "s", "--in-memory", "-w", "3"])
                .unwrap_err();
            assert!(err.to_string().contains("in-memory"));

            let config =
                parse(&["auth-server", "--jwt-secret", "s", "--in-memory", "-w", "1"]).unwrap();
            assert_eq!(config.store, StoreConfig::InMemory);
        });
    }

    #[test]
    fn test_rejects_bad_values() {
        temp_env::with_vars(CLEAN_ENV, || {
            for args in [
                vec!["auth-server", "--jwt-secret", "s", "--token-lifetime", "0"],
                vec!["auth-server", "--jwt-secret", "s", "--token-lifetime", "31536001"],
                vec!["auth-server", "--jwt-secret", "s", "--token-lifetime", "18446744073709551615"],
                vec!["auth-server", "--jwt-secret", "s", "--workers", "0"],
                vec!["auth-server", "--jwt-secret", "s", "--allowed-origin", "localhost"],
                vec!["auth-server", "--jwt-secret", "s", "--host", "not-an-ip"],
                vec!["auth-server", "--jwt-secret", "", "-w", "1"],
            ] {
                assert!(parse(&args).is_err(), "{args:?} should be refused");
            }
        });
    }

    #[test]
    fn test_token_lifetime_up_to_a_year() {
        temp_env::with_vars(CLEAN_ENV, || {
            let config = parse(&[
                "auth-server",
                "--jwt-secret",
                "s",
                "-w",
                "1",
                "--token-lifetime",
                "31536000",
            ])
            .unwrap();
            assert_eq!(config.token_lifetime, Duration::from_secs(31_536_000));
        });
    }

    #[test]
    fn test_worker_id_is_hidden() {
        temp_env::with_vars(CLEAN_ENV, || {
            let config = parse(&["auth-server", "--jwt-secret", "s", "-w", "2", "--worker-id", "1"])
                .unwrap();
            assert_eq!(config.worker_id, Some(1));

            let help = new().render_help().to_string();
            assert!(!help.contains("--worker-id"));
        });
    }
}
