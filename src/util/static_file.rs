use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::response::Response;
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "$PROCESSED_STATIC_PATH/"]
pub struct Asset;

/// An embedded frontend asset; `.gz` variants are served with `Content-Encoding: gzip`.
pub struct StaticFile<T>(pub T);

impl<T> IntoResponse for StaticFile<T>
where
    T: Into<String>,
{
    fn into_response(self) -> Response {
        let path: String = self.0.into();

        let Some(content) = Asset::get(path.as_str()) else {
            return (StatusCode::NOT_FOUND, "404 Not Found").into_response();
        };

        match path.strip_suffix(".gz") {
            Some(original) => {
                let mime = mime_guess::from_path(original).first_or_octet_stream();
                (
                    [
                        (header::CONTENT_TYPE, mime.as_ref()),
                        (header::CONTENT_ENCODING, "gzip"),
                        (header::CACHE_CONTROL, "public, max-age=3600"),
                    ],
                    content.data,
                )
                    .into_response()
            }
            None => {
                let mime = mime_guess::from_path(&path).first_or_octet_stream();
                (
                    [
                        (header::CONTENT_TYPE, mime.as_ref()),
                        (header::CACHE_CONTROL, "public, max-age=3600"),
                    ],
                    content.data,
                )
                    .into_response()
            }
        }
    }
}
