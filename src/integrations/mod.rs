//! Device integrations. Each one builds its entities on top of the shared
//! [`AppState`](crate::api::AppState).

pub mod upb;
