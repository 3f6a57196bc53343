use askama::Template;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use tracing::error;

/// Render a [`Template`] into a [`Response`], or a plain 500 page when rendering fails.
pub fn into_response<T: ?Sized + Template>(tmpl: &T) -> Response {
    match tmpl.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static(T::MIME_TYPE))],
            body,
        )
            .into_response(),
        Err(err) => {
            error!("Template rendering failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html("<h1>500</h1><p>Template error</p>"),
            )
                .into_response()
        }
    }
}
