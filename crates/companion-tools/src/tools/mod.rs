//! Built-in tools.

pub mod fetch_url;
pub mod keep_response;
pub mod load_attachment;
pub mod send_message;
pub mod web_search;
pub mod workspace_search;
