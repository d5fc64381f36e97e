mod canonical;
mod connect;
mod devfs;
mod inbound;
mod isolates;
mod reload_sources;
mod views;
