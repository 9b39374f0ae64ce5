/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Relay heartbeat and stale subscriber sweeping.
pub mod heartbeat;
/// Durable session snapshot operations behind the HTTP boundary.
pub mod session_service;
/// Storage connection supervision and degraded mode.
pub mod storage_supervisor;
/// Relay WebSocket connection handling.
pub mod websocket_service;
