pub(crate) mod bootstrap;
mod circuit;
mod control_port;
mod host;
pub(crate) mod loop_runner;
mod marker;
mod paths;
mod session;
mod settings;
mod workers;
