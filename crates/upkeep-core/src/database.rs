use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::command::{CommandRunner, CommandSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseDriver {
    Mysql,
    Postgres,
}

impl DatabaseDriver {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    pub fn parse_scheme(scheme: &str) -> Option<Self> {
        match scheme.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mysql2" | "mysqli" | "mariadb" | "pdo-mysql" | "pdo_mysql" => {
                Some(Self::Mysql)
            }
            "postgres" | "postgresql" | "pgsql" | "pdo-pgsql" | "pdo_pgsql" => {
                Some(Self::Postgres)
            }
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Mysql => 3306,
            Self::Postgres => 5432,
        }
    }

    /// Runtime extension the application needs to talk to this driver.
    pub fn runtime_extension(self) -> &'static str {
        match self {
            Self::Mysql => "pdo_mysql",
            Self::Postgres => "pdo_pgsql",
        }
    }

    pub fn client_binary(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "psql",
        }
    }

    pub fn dump_binary(self) -> &'static str {
        match self {
            Self::Mysql => "mysqldump",
            Self::Postgres => "pg_dump",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    pub driver: DatabaseDriver,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl fmt::Debug for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseUrl")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

impl DatabaseUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| anyhow!("invalid database url: missing scheme separator"))?;
        let driver = DatabaseDriver::parse_scheme(scheme)
            .ok_or_else(|| anyhow!("unsupported database url scheme: '{scheme}'"))?;

        let rest = rest.split('#').next().unwrap_or(rest);
        let rest = rest.split('?').next().unwrap_or(rest);

        let (userinfo, host_and_path) = match rest.rfind('@') {
            Some(index) => (Some(&rest[..index]), &rest[index + 1..]),
            None => (None, rest),
        };
        let (host_port, database) = host_and_path
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid database url: missing database name"))?;
        let database = percent_decode(database.trim_end_matches('/'))
            .context("invalid database url: database name")?;
        if database.is_empty() {
            return Err(anyhow!("invalid database url: missing database name"));
        }

        let (user, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, password)) => (
                    percent_decode(user).context("invalid database url: user")?,
                    Some(percent_decode(password).context("invalid database url: password")?),
                ),
                None => (
                    percent_decode(userinfo).context("invalid database url: user")?,
                    None,
                ),
            },
            None => (String::new(), None),
        };

        let (host, port) = split_host_port(host_port)?;
        let host = if host.is_empty() {
            "localhost".to_string()
        } else {
            host
        };

        Ok(Self {
            driver,
            host,
            port: port.unwrap_or_else(|| driver.default_port()),
            user,
            password,
            database,
        })
    }

    pub fn redacted(&self) -> String {
        let credentials = match (&self.user, &self.password) {
            (user, _) if user.is_empty() => String::new(),
            (user, Some(_)) => format!("{user}:***@"),
            (user, None) => format!("{user}@"),
        };
        format!(
            "{}://{}{}:{}/{}",
            self.driver.as_str(),
            credentials,
            self.host,
            self.port,
            self.database
        )
    }

    /// Interactive client invocation bound to this connection.
    pub fn client_command(&self) -> CommandSpec {
        let spec = match self.driver {
            DatabaseDriver::Mysql => CommandSpec::new(self.driver.client_binary())
                .arg(format!("--host={}", self.host))
                .arg(format!("--port={}", self.port))
                .args(self.user_arg("--user")),
            DatabaseDriver::Postgres => CommandSpec::new(self.driver.client_binary())
                .arg(format!("--host={}", self.host))
                .arg(format!("--port={}", self.port))
                .args(self.user_arg("--username"))
                .arg(format!("--dbname={}", self.database))
                .arg("--no-psqlrc")
                .arg("--quiet"),
        };
        self.with_password(spec)
    }

    pub fn query_command(&self, sql: &str) -> CommandSpec {
        match self.driver {
            DatabaseDriver::Mysql => self
                .client_command()
                .arg("--batch")
                .arg("--skip-column-names")
                .arg(format!("--execute={sql}"))
                .arg(&self.database),
            DatabaseDriver::Postgres => self
                .client_command()
                .arg("--tuples-only")
                .arg("--no-align")
                .arg(format!("--command={sql}")),
        }
    }

    pub fn restore_command(&self) -> CommandSpec {
        match self.driver {
            DatabaseDriver::Mysql => self.client_command().arg(&self.database),
            DatabaseDriver::Postgres => self.client_command().arg("--set=ON_ERROR_STOP=1"),
        }
    }

    pub fn dump_command(&self) -> CommandSpec {
        let spec = match self.driver {
            DatabaseDriver::Mysql => CommandSpec::new(self.driver.dump_binary())
                .arg(format!("--host={}", self.host))
                .arg(format!("--port={}", self.port))
                .args(self.user_arg("--user"))
                .arg("--single-transaction")
                .arg("--routines")
                .arg("--triggers")
                .arg("--add-drop-table")
                .arg(&self.database),
            DatabaseDriver::Postgres => CommandSpec::new(self.driver.dump_binary())
                .arg(format!("--host={}", self.host))
                .arg(format!("--port={}", self.port))
                .args(self.user_arg("--username"))
                .arg("--no-owner")
                .arg("--clean")
                .arg("--if-exists")
                .arg(&self.database),
        };
        self.with_password(spec)
    }

    fn user_arg(&self, flag: &str) -> Option<String> {
        if self.user.is_empty() {
            None
        } else {
            Some(format!("{flag}={}", self.user))
        }
    }

    fn with_password(&self, spec: CommandSpec) -> CommandSpec {
        match (&self.password, self.driver) {
            (Some(password), DatabaseDriver::Mysql) => spec.env("MYSQL_PWD", password),
            (Some(password), DatabaseDriver::Postgres) => spec.env("PGPASSWORD", password),
            (None, _) => spec,
        }
    }
}

fn split_host_port(host_port: &str) -> Result<(String, Option<u16>)> {
    if let Some(stripped) = host_port.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid database url: unterminated IPv6 host"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(port)?))),
        None => Ok((host_port.to_string(), None)),
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    raw.parse::<u16>()
        .with_context(|| format!("invalid database url port: '{raw}'"))
}

fn percent_decode(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = raw
                .get(index + 1..index + 3)
                .ok_or_else(|| anyhow!("truncated percent escape"))?;
            let value = u8::from_str_radix(hex, 16)
                .with_context(|| format!("invalid percent escape: %{hex}"))?;
            out.push(value);
            index += 3;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(out).context("percent-decoded value is not UTF-8")
}

/// Single handle to the application database.
pub trait Database {
    fn url(&self) -> &DatabaseUrl;

    /// First column of the first row, or `None` for an empty result.
    fn query_scalar(&self, sql: &str) -> Result<Option<String>>;

    fn ping(&self) -> Result<()> {
        match self.query_scalar("SELECT 1")? {
            Some(value) if value.trim() == "1" => Ok(()),
            other => Err(anyhow!("unexpected SELECT 1 result: {other:?}")),
        }
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        if table.is_empty()
            || !table
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(anyhow!("invalid table name: '{table}'"));
        }
        let sql = match self.url().driver {
            DatabaseDriver::Mysql => format!(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = '{table}'"
            ),
            DatabaseDriver::Postgres => format!(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = '{table}'"
            ),
        };
        let count = self.query_scalar(&sql)?.unwrap_or_default();
        Ok(count.trim().parse::<u64>().unwrap_or(0) > 0)
    }
}

/// Database handle backed by the vendor command-line client.
pub struct CliDatabase {
    url: DatabaseUrl,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl CliDatabase {
    pub fn new(url: DatabaseUrl, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            url,
            runner,
            timeout,
        }
    }
}

impl Database for CliDatabase {
    fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        let spec = self.url.query_command(sql).timeout(self.timeout);
        debug!(database = %self.url.redacted(), sql, "running database query");
        let output = self
            .runner
            .run(&spec)
            .with_context(|| format!("failed launching {}", spec.program))?;
        if !output.success() {
            return Err(anyhow!(
                "database query failed against {}: {}",
                self.url.redacted(),
                output.failure_detail()
            ));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.split('\t').next().unwrap_or(line).to_string()))
    }
}
