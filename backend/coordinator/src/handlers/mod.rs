pub mod admin;
pub mod jobs;
pub mod transfer;
pub mod workers;

use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/worker")
            .route("/register", web::post().to(workers::register))
            .route("/heartbeat", web::post().to(workers::heartbeat))
            .route("/workers", web::get().to(workers::list))
            .route("/claim", web::post().to(jobs::claim))
            .route("/jobs/{job_id}/progress", web::post().to(jobs::progress))
            .route("/jobs/{job_id}/complete", web::post().to(jobs::complete))
            .route("/jobs/{job_id}/fail", web::post().to(jobs::fail))
            .route("/source/{video_id}", web::get().to(transfer::download_source))
            .route(
                "/upload/{video_id}/quality/{quality}",
                web::post().to(transfer::upload_quality),
            )
            .route(
                "/upload/{video_id}/finalize",
                web::post().to(transfer::upload_finalize),
            )
            .route("/queue/stats", web::get().to(admin::queue_stats)),
    )
    .service(
        web::scope("/api/admin")
            .route("/videos", web::get().to(admin::list_videos))
            .route("/videos", web::post().to(admin::create_video))
            .route("/videos/{video_id}", web::get().to(admin::get_video))
            .route("/videos/{video_id}", web::delete().to(admin::delete_video))
            .route(
                "/videos/{video_id}/restore",
                web::post().to(admin::restore_video),
            )
            .route(
                "/videos/{video_id}/retranscode",
                web::post().to(admin::retranscode_video),
            ),
    );
}
