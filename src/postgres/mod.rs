// ABOUTME: PostgreSQL connectivity for the leader and follower databases
// ABOUTME: TLS policy, connection helpers and permission preflight checks

pub mod connection;
pub mod privileges;

pub use connection::{connect, connect_with_retry, init_tls_policy};
pub use privileges::{check_privileges, check_trigger_permissions, PrivilegeCheck, TablePermissionCheck};
