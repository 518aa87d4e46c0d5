//! API response helpers, grounded on the teacher's `api/response.rs` wrapper
//! shapes (`SuccessResponse`, `PaginatedResponse`).

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self { success: true, data }
    }
}

pub fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, Json(SuccessResponse::new(data)))
}

pub fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, Json(SuccessResponse::new(data)))
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
}

impl<T: Serialize> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total: usize) -> Self {
        Self { data, total }
    }
}

pub fn paginated<T: Serialize>(data: Vec<T>, total: usize) -> impl IntoResponse {
    (StatusCode::OK, Json(PaginatedResponse::new(data, total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct TestData {
        id: u32,
    }

    #[test]
    fn success_response_sets_flag() {
        let resp = SuccessResponse::new(TestData { id: 1 });
        assert!(resp.success);
    }

    #[test]
    fn paginated_response_carries_total() {
        let resp = PaginatedResponse::new(vec![TestData { id: 1 }, TestData { id: 2 }], 2);
        assert_eq!(resp.total, 2);
        assert_eq!(resp.data.len(), 2);
    }
}
