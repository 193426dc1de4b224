//! Prometheus scrape endpoint (SPEC_FULL.md §2.13). Deliberately minimal:
//! this node exposes the default registry for a scraper to pull, it does not
//! ship dashboards or alerting rules — those live in the operator's own
//! observability stack.

use actix_web::{get, web, HttpResponse, Responder};
use prometheus::{Encoder, TextEncoder};

#[get("/metrics")]
async fn metrics() -> impl Responder {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("failed to encode metrics: {err}");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

pub fn config_metrics_api(cfg: &mut web::ServiceConfig) {
    cfg.service(metrics);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn metrics_endpoint_serves_text_format() {
        let app = test::init_service(App::new().configure(config_metrics_api)).await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }
}
