pub mod proxy_socket;
pub mod tcp;
pub mod udp;
