const HANDSHAKE_PORT: &str = "HANDSHAKE_PORT";

const DEFAULT_HANDSHAKE_PORT: u16 = 65431;

pub fn get_handshake_port() -> u16 {
    let port_from_env = std::env::var(HANDSHAKE_PORT);
    port_from_env.map_or(DEFAULT_HANDSHAKE_PORT, |res| {
        res.parse().unwrap_or(DEFAULT_HANDSHAKE_PORT)
    })
}

const SERVER_IP: &str = "SERVER_IP";

const DEFAULT_SERVER_IP: &str = "127.0.0.1";

pub fn get_server_ip() -> String {
    std::env::var(SERVER_IP).unwrap_or_else(|_| DEFAULT_SERVER_IP.to_string())
}

const SMTP_SERVER: &str = "SMTP_SERVER";

const DEFAULT_SMTP_SERVER: &str = "smtp.gmail.com";

pub fn get_smtp_server() -> String {
    std::env::var(SMTP_SERVER).unwrap_or_else(|_| DEFAULT_SMTP_SERVER.to_string())
}

const SMTP_PORT: &str = "SMTP_PORT";

const DEFAULT_SMTP_PORT: u16 = 587;

pub fn get_smtp_port() -> u16 {
    let port_from_env = std::env::var(SMTP_PORT);
    port_from_env.map_or(DEFAULT_SMTP_PORT, |res| res.parse().unwrap_or(DEFAULT_SMTP_PORT))
}

const SENDER_EMAIL: &str = "SENDER_EMAIL";

pub fn get_sender_email() -> Option<String> {
    std::env::var(SENDER_EMAIL).ok()
}

const SENDER_PASSWORD: &str = "SENDER_PASSWORD";

pub fn get_sender_password() -> Option<String> {
    std::env::var(SENDER_PASSWORD).ok()
}

/// Identity of this machine in the node role table
pub fn node_id() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
