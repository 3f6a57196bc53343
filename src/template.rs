use askama::Template;
use axum::response::{IntoResponse, Response};

use crate::util::template::into_response;

#[derive(Template)]
#[template(path = "index.html")]
pub(crate) struct IndexTemplate {
    pub version: String,
    pub poll_interval_secs: u64,
}

impl IntoResponse for IndexTemplate {
    fn into_response(self) -> Response {
        into_response(&self)
    }
}
