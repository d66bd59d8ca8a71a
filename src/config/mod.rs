use serde::Deserialize;
use std::env;

use crate::services::ServiceError;

/// Top-level service configuration, loaded from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub two_factor: TwoFactorConfig,
    pub cache: CacheConfig,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Shared HMAC-SHA256 signing secret.
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwoFactorConfig {
    pub code_digits: u32,
    pub code_expiry_minutes: i64,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            code_digits: 6,
            code_expiry_minutes: 5,
        }
    }
}

/// TTLs for the resolved-permission cache. Role entries get a longer
/// absolute TTL since role definitions change less often than user
/// memberships.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub user_ttl_minutes: i64,
    pub role_ttl_minutes: i64,
    pub sliding_ttl_minutes: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            user_ttl_minutes: 30,
            role_ttl_minutes: 60,
            sliding_ttl_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, ServiceError> {
        dotenvy::dotenv().ok();

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(ServiceError::ConfigError)?;

        let is_prod = environment == Environment::Prod;

        let config = IdentityConfig {
            environment,
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?,
            },
            jwt: JwtConfig {
                secret: get_env(
                    "JWT_SECRET",
                    Some("dev-secret-change-me-0123456789abcdef"),
                    is_prod,
                )?,
                issuer: get_env("JWT_ISSUER", Some("identity-service"), is_prod)?,
                audience: get_env("JWT_AUDIENCE", Some("internal-apps"), is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    Some("15"),
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    Some("7"),
                    is_prod,
                )?,
            },
            two_factor: TwoFactorConfig {
                code_digits: parse_env("TWO_FACTOR_CODE_DIGITS", Some("6"), is_prod)?,
                code_expiry_minutes: parse_env("TWO_FACTOR_CODE_EXPIRY_MINUTES", Some("5"), is_prod)?,
            },
            cache: CacheConfig {
                user_ttl_minutes: parse_env("CACHE_USER_TTL_MINUTES", Some("30"), is_prod)?,
                role_ttl_minutes: parse_env("CACHE_ROLE_TTL_MINUTES", Some("60"), is_prod)?,
                sliding_ttl_minutes: parse_env("CACHE_SLIDING_TTL_MINUTES", Some("5"), is_prod)?,
            },
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("localhost"), is_prod)?,
                username: get_env("SMTP_USERNAME", Some(""), is_prod)?,
                password: get_env("SMTP_PASSWORD", Some(""), is_prod)?,
                from_address: get_env("SMTP_FROM", Some("no-reply@localhost"), is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(ServiceError::ConfigError(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive".to_string(),
            ));
        }
        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(ServiceError::ConfigError(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive".to_string(),
            ));
        }
        if self.environment == Environment::Prod && self.jwt.secret.len() < 32 {
            return Err(ServiceError::ConfigError(
                "JWT_SECRET must be at least 32 bytes in production".to_string(),
            ));
        }
        if self.two_factor.code_digits < 4 || self.two_factor.code_digits > 10 {
            return Err(ServiceError::ConfigError(
                "TWO_FACTOR_CODE_DIGITS must be between 4 and 10".to_string(),
            ));
        }
        if self.two_factor.code_expiry_minutes <= 0 {
            return Err(ServiceError::ConfigError(
                "TWO_FACTOR_CODE_EXPIRY_MINUTES must be positive".to_string(),
            ));
        }
        if self.cache.user_ttl_minutes <= 0
            || self.cache.role_ttl_minutes <= 0
            || self.cache.sliding_ttl_minutes <= 0
        {
            return Err(ServiceError::ConfigError(
                "cache TTLs must be positive".to_string(),
            ));
        }
        if self.cache.sliding_ttl_minutes > self.cache.user_ttl_minutes {
            return Err(ServiceError::ConfigError(
                "CACHE_SLIDING_TTL_MINUTES must not exceed CACHE_USER_TTL_MINUTES".to_string(),
            ));
        }
        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, ServiceError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(ServiceError::ConfigError(format!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(ServiceError::ConfigError(format!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: Option<&str>, is_prod: bool) -> Result<T, ServiceError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, default, is_prod)?
        .parse()
        .map_err(|e: T::Err| ServiceError::ConfigError(format!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
