pub mod api;
pub mod auth;
pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod monitor;
pub mod observer;
pub mod reporter;
pub mod signout;
pub mod state;
pub mod types;

/// Prolific REST API base URL (bearer auth required)
pub const API_BASE: &str = "https://www.prolific.co/api/v1";

/// Every request under this prefix is inspected for the `Authorization` header.
pub const API_URL_PREFIX: &str = "https://www.prolific.co/api/";

/// "Current user" endpoint; its responses carry the account id.
pub const USERS_URL_PREFIX: &str = "https://www.prolific.co/api/v1/users/";

/// OAuth authorize endpoint. Its redirect `location` carries the access token in the fragment.
pub const AUTH_URL_PREFIX: &str = "https://www.prolific.co/openid/authorize";

/// Participant app; opening it makes the page send authenticated API requests.
pub const APP_URL: &str = "https://app.prolific.co/";

/// Classic login page, hit with a full navigation after sign-out.
pub const LOGIN_PAGE_URL: &str = "https://www.prolific.co/auth/accounts/login/";

/// Single-page-app login route, reached via history state update.
pub const APP_LOGIN_URL: &str = "https://app.prolific.co/login";

/// Base URL for opening a study in a tab.
pub const APP_STUDIES_URL: &str = "https://app.prolific.co/studies";
