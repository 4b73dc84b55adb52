//! HTTP/WebSocket surface for the BPMN-Flow engine: workflow submission,
//! status and cancellation, email-approval webhooks, and the bidirectional
//! observer stream.

pub mod http;
pub mod ws;
