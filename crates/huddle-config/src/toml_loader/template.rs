//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# Huddle Configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[relay]
# url = "ws://127.0.0.1:8080"
# listen_port = 8080          # 1024-65535
# heartbeat_interval = 25     # 5-120 seconds
# reconnect_delay = 1         # 1-60 seconds
# max_reconnect_delay = 30    # 1-600 seconds
# request_timeout = 10        # 1-120 seconds
# idle_timeout = 60           # 10-600 seconds, above heartbeat_interval

[presence]
# enabled = true
# evict_offline_members = true

[voice]
# enabled = true
# max_participants = 8        # 2-16
# input_device = "default"
# output_device = "default"

[[voice.ice_servers]]
urls = ["stun:stun1.l.google.com:19302", "stun:stun2.l.google.com:19302"]

[[voice.ice_servers]]
urls = ["turn:openrelay.metered.ca:80"]
username = "openrelayproject"
credential = "openrelayproject"

[logging]
# level = "INFO"              # TRACE, DEBUG, INFO, WARNING, ERROR
# json = false
"##
    .to_string()
}
