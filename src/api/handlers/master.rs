use actix_web::{web, HttpResponse};

use crate::api::handlers::GatewayState;
use crate::api::types::ApiResult;

pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(ApiResult::success("pong"))
}

pub async fn info(state: web::Data<GatewayState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResult::success(&state.info))
}
