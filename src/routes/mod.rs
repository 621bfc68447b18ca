use crate::models::AppState;
use axum::Router;

pub mod appointment_routes;
pub mod feedback_routes;
pub mod home_routes;
pub mod payment_routes;
pub mod shipping_routes;
pub mod slot_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", appointment_routes::router())
        .nest("/api/v1", slot_routes::router())
        .nest("/api/v1", payment_routes::router())
        .nest("/api/v1", shipping_routes::router())
        .nest("/api/v1", feedback_routes::router())
        .merge(home_routes::router())
        .with_state(state)
}
