/// Built-in service objects registered at startup
/// Each exposes its verb-prefixed members through the handler registry
pub mod echo;
pub mod system;

// Re-export for convenience
pub use echo::EchoService;
pub use system::SystemService;
