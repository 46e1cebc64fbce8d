//! TokenReview error envelopes.
//!
//! # Purpose
//! Every outcome of the TokenReview endpoint, including rejections, must be a
//! parseable TokenReview object; these helpers build the envelopes and attach
//! the right status codes.
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewStatus};

/// A terminal rejection carrying a non-200 status and a TokenReview body.
#[derive(Debug)]
pub struct ReviewRejection {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ReviewRejection {
    fn into_response(self) -> Response {
        (self.status, Json(review_envelope(&self.message))).into_response()
    }
}

/// An unauthenticated TokenReview with an error message.
pub fn review_envelope(message: &str) -> TokenReview {
    TokenReview {
        status: Some(TokenReviewStatus {
            authenticated: Some(false),
            error: Some(message.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn bad_request(message: &str) -> ReviewRejection {
    ReviewRejection {
        status: StatusCode::BAD_REQUEST,
        message: message.to_string(),
    }
}

pub fn unauthorized(message: &str) -> ReviewRejection {
    ReviewRejection {
        status: StatusCode::UNAUTHORIZED,
        message: message.to_string(),
    }
}

pub fn forbidden(message: &str) -> ReviewRejection {
    ReviewRejection {
        status: StatusCode::FORBIDDEN,
        message: message.to_string(),
    }
}

/// A 200 response whose TokenReview reports `authenticated: false`. Used for
/// outcomes that are answers, not protocol errors.
pub fn unauthenticated(message: &str) -> Response {
    (StatusCode::OK, Json(review_envelope(message))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_a_well_formed_token_review() {
        let review = review_envelope("bad things");
        let value = serde_json::to_value(&review).unwrap();
        assert_eq!(value["apiVersion"], "authentication.k8s.io/v1");
        assert_eq!(value["kind"], "TokenReview");
        assert_eq!(value["status"]["authenticated"], false);
        assert_eq!(value["status"]["error"], "bad things");
    }
}
