pub mod audit;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod email;
pub mod error;
pub mod jwt;
pub mod resolver;
pub mod tokens;
pub mod two_factor;

pub use audit::{ActivityLog, TracingActivityLog};
pub use auth::{AuthService, LoginOutcome, RegisterRequest, TokenResponse};
pub use cache::{CacheKey, PermissionCache, SubjectKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use email::{EmailProvider, EmailService, MockEmailService};
pub use error::ServiceError;
pub use jwt::{AccessTokenClaims, JwtService};
pub use resolver::{BulkItemOutcome, BulkItemStatus, BulkReport, PermissionResolver};
pub use tokens::RefreshTokenService;
pub use two_factor::TwoFactorService;
