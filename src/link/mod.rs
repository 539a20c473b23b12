pub mod proxy_link;
