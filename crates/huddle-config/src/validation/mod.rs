//! Full configuration validation.
//!
//! Validates numeric ranges and endpoint formats, collecting every problem
//! into a single `ConfigError`.

mod helpers;


use crate::schema::HuddleConfig;
use huddle_common::ConfigError;

use helpers::validate_range;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &HuddleConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_relay(&mut errors, config);
    validate_voice(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}

fn validate_relay(errors: &mut Vec<String>, config: &HuddleConfig) {
    let relay = &config.relay;
    if !(relay.url.starts_with("ws://") || relay.url.starts_with("wss://")) {
        errors.push(format!("relay.url = {:?} must be a ws:// or wss:// URL", relay.url));
    }
    validate_range(errors, "relay.listen_port", relay.listen_port, 1024, 65535);
    validate_range(errors, "relay.heartbeat_interval", relay.heartbeat_interval, 5, 120);
    validate_range(errors, "relay.reconnect_delay", relay.reconnect_delay, 1, 60);
    validate_range(
        errors,
        "relay.max_reconnect_delay",
        relay.max_reconnect_delay,
        1,
        600,
    );
    if relay.max_reconnect_delay < relay.reconnect_delay {
        errors.push("relay.max_reconnect_delay must be >= relay.reconnect_delay".into());
    }
    validate_range(errors, "relay.request_timeout", relay.request_timeout, 1, 120);
    validate_range(errors, "relay.idle_timeout", relay.idle_timeout, 10, 600);
    if relay.idle_timeout <= relay.heartbeat_interval {
        errors.push("relay.idle_timeout must be > relay.heartbeat_interval".into());
    }
}

fn validate_voice(errors: &mut Vec<String>, config: &HuddleConfig) {
    let voice = &config.voice;
    validate_range(errors, "voice.max_participants", voice.max_participants, 2, 16);
    for (i, server) in voice.ice_servers.iter().enumerate() {
        if server.urls.is_empty() {
            errors.push(format!("voice.ice_servers[{i}].urls must not be empty"));
        }
        for url in &server.urls {
            let known = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !known {
                errors.push(format!("voice.ice_servers[{i}] has unsupported url {url:?}"));
            }
        }
        if server.username.is_some() != server.credential.is_some() {
            errors.push(format!(
                "voice.ice_servers[{i}] needs both username and credential or neither"
            ));
        }
    }
}
