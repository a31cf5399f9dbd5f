use actix_web::web;

pub mod presence;
pub mod push;
pub mod wsroute;

/// Mount every HTTP and WebSocket route of the service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(wsroute::ws_handler)
        .service(push::push_one)
        .service(push::push_batch)
        .service(push::push_users)
        .service(presence::get_presence)
        .route("/metrics", web::get().to(crate::metrics::metrics_handler))
        .route("/health", web::get().to(|| async { "OK" }));
}
