use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the planning poker backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::session::get_session,
        crate::routes::session::put_session,
        crate::routes::session::delete_session,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::session::SessionSaved,
            crate::dto::ws::RelayInboundMessage,
            crate::dto::ws::RelayOutboundMessage,
            crate::state::session::GameState,
            crate::state::session::Player,
            crate::state::session::Vote,
            crate::state::session::StoryPoint,
            crate::state::aggregates::VoteStats,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Durable session snapshots"),
        (name = "relay", description = "Realtime WebSocket relay between session clients"),
    )
)]
/// OpenAPI document of the HTTP surface.
pub struct ApiDoc;
