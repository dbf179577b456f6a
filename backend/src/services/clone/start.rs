use crate::services::stream::start_sync;
use crate::sync::SyncMode;
use actix_multipart::Multipart;
use actix_web::Responder;

pub(crate) async fn process(payload: Multipart) -> impl Responder {
    start_sync(payload, SyncMode::Clone).await
}
