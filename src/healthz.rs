//! Unauthenticated healthz probe (spec.md §6.4): returns 200 "OK" once the
//! node has reached `Healthy`, otherwise 500 with a short reason string.
//! Wired the way the teacher wires its actix services — a handler function
//! plus a `config_*_api(cfg: &mut web::ServiceConfig)` registration helper.

use actix_web::{get, web, HttpResponse, Responder};
use storage::{NodeLifecycle, NodeState};

#[get("/healthz")]
async fn healthz(node: web::Data<std::sync::Arc<NodeLifecycle>>) -> impl Responder {
    match node.state() {
        NodeState::Healthy => HttpResponse::Ok().body("OK"),
        NodeState::Initializing => HttpResponse::InternalServerError().body("initializing"),
        NodeState::Stopping => HttpResponse::InternalServerError().body("stopping"),
        NodeState::Stopped => HttpResponse::InternalServerError().body("stopped"),
    }
}

pub fn config_healthz_api(cfg: &mut web::ServiceConfig) {
    cfg.service(healthz);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use std::time::Duration;

    #[actix_web::test]
    async fn healthz_rejects_until_registered() {
        let node = NodeLifecycle::init(4, Duration::from_millis(50));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(node.clone()))
                .configure(config_healthz_api),
        )
        .await;

        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_server_error());

        node.register();
        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }
}
