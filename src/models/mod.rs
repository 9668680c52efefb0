pub mod mcp_server;
pub mod mcp_server_oauth_token;
pub mod tool;
