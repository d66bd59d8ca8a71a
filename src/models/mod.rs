pub mod audit_event;
pub mod permission;
pub mod refresh_token;
pub mod role;
pub mod user;

pub use audit_event::{AuditEvent, AuditEventType};
pub use permission::{Permission, PermissionCategory, PermissionSort, RoleGrant};
pub use refresh_token::RefreshToken;
pub use role::Role;
pub use user::{User, UserState};
