//! Runtime configuration.
//!
//! The command line mirrors the protocol's traditional shape:
//!
//! ```text
//! stegomux <mode> <up_address> (<down_address> <steg>)...
//! ```
//!
//! where mode is `client`, `socks`, or `server`. The up-address is where a
//! client listens (or the server connects to the real upstream); each
//! down-address is a cover-protocol endpoint paired with the steg module
//! that dresses it. The shared passphrase is never taken from the command
//! line (it would leak through process listings), only from the
//! environment, falling back to the protocol's fixed phrase.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::steg;

/// The protocol's fixed fallback passphrase.
pub const DEFAULT_PASSPHRASE: &str =
    "did you buy one of therapist reawaken chemists continually gamma pacifies?";

/// Environment variable that overrides the shared passphrase.
pub const PASSPHRASE_ENV: &str = "STEGOMUX_PASSPHRASE";

/// Which end of the protocol this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain client: listen upstream, dial cover endpoints
    Client,
    /// SOCKS client: same, behind a SOCKS front-end
    Socks,
    /// Server: listen on cover endpoints, dial the real upstream
    Server,
}

impl Mode {
    /// Default port for the up-address when none is given.
    pub fn default_port(self) -> u16 {
        match self {
            Mode::Client => 48988,
            Mode::Socks => 23548,
            Mode::Server => 11253,
        }
    }

    /// True for the server end.
    pub fn is_server(self) -> bool {
        matches!(self, Mode::Server)
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client" => Ok(Mode::Client),
            "socks" => Ok(Mode::Socks),
            "server" => Ok(Mode::Server),
            other => Err(Error::config(format!("unknown mode '{other}'"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Client => "client",
            Mode::Socks => "socks",
            Mode::Server => "server",
        })
    }
}

/// One cover-protocol endpoint and the steg module dressing it.
#[derive(Debug, Clone)]
pub struct DownstreamTarget {
    /// Cover endpoint: listened on by the server, dialed by the client
    pub addr: SocketAddr,
    /// Registered steg module name
    pub steg: String,
}

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol end
    pub mode: Mode,
    /// Upstream application endpoint
    pub up_address: SocketAddr,
    /// Cover endpoints, in command-line order
    pub downstreams: Vec<DownstreamTarget>,
    /// Shared passphrase for circuit key derivation
    pub passphrase: Vec<u8>,
}

impl Config {
    /// Parse `<mode> <up_address> (<down_address> <steg>)...`.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() < 4 {
            return Err(Error::config("not enough parameters"));
        }

        let mode: Mode = args[0].as_ref().parse()?;
        let up_address = resolve(args[1].as_ref(), Some(mode.default_port()))
            .map_err(|e| Error::config(format!("invalid up address: {e}")))?;

        // The remaining arguments alternate between downstream addresses
        // and steg module names.
        let mut downstreams = Vec::new();
        let mut rest = args[2..].iter();
        while let Some(addr_arg) = rest.next() {
            let addr = resolve(addr_arg.as_ref(), None)
                .map_err(|e| Error::config(format!("invalid down address: {e}")))?;
            let Some(steg_arg) = rest.next() else {
                return Err(Error::config(format!(
                    "missing steganographer for {}",
                    addr_arg.as_ref()
                )));
            };
            let name = steg_arg.as_ref();
            if !steg::is_supported(name) {
                return Err(Error::config(format!(
                    "steganographer '{name}' not supported"
                )));
            }
            downstreams.push(DownstreamTarget {
                addr,
                steg: name.to_owned(),
            });
        }

        Ok(Self {
            mode,
            up_address,
            downstreams,
            passphrase: passphrase_from_env(),
        })
    }

    /// One-line usage synopsis plus examples.
    pub fn usage() -> &'static str {
        "stegomux <mode> <up_address> (<down_address> <steg>)...\n\
         \tmode ~ server|client|socks\n\
         \tup_address, down_address ~ host:port\n\
         \tA steganographer is required for each down_address.\n\
         Examples:\n\
         \tstegomux client 127.0.0.1:5000 192.168.1.99:11253 nosteg\n\
         \tstegomux server 127.0.0.1:9005 192.168.1.99:11253 nosteg"
    }
}

fn passphrase_from_env() -> Vec<u8> {
    match std::env::var(PASSPHRASE_ENV) {
        Ok(phrase) if !phrase.is_empty() => phrase.into_bytes(),
        _ => DEFAULT_PASSPHRASE.as_bytes().to_vec(),
    }
}

/// Resolve `host[:port]`, supplying `default_port` when the port is absent
/// and one is allowed.
fn resolve(spec: &str, default_port: Option<u16>) -> Result<SocketAddr> {
    let candidates = match spec.to_socket_addrs() {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(_) => match default_port {
            Some(port) => (spec, port)
                .to_socket_addrs()
                .map_err(|e| Error::config(format!("{spec}: {e}")))?
                .collect(),
            None => {
                return Err(Error::config(format!("{spec}: missing or invalid port")));
            }
        },
    };
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::config(format!("{spec}: no usable address")))
}
