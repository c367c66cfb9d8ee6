//! Source resolver.
//!
//! Finds, once per engine lifetime, which raw frame-rate sources a device
//! actually has: a `measured_fps` style counter file and the compositor
//! introspection command. Negative answers are cached as firmly as positive
//! ones; a device that lacks the sysfs node never grows one.

use crate::config::EngineConfig;
use crate::executor::{is_error_sentinel, CommandExecutor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Counter files exposed by common display drivers, in probing order.
pub const WELL_KNOWN_COUNTER_PATHS: [&str; 2] = [
    "/sys/class/drm/sde-crtc-0/measured_fps",
    "/sys/class/graphics/fb0/measured_fps",
];

/// Roots searched when none of the well-known counter files exist.
pub const DEFAULT_SEARCH_ROOTS: [&str; 2] = ["/sys/class/drm", "/sys/class/graphics"];

/// File name the dynamic search looks for.
pub const COUNTER_FILE_NAME: &str = "measured_fps";

/// Compositor introspection command returning the frame counter parcel.
pub const DEFAULT_COUNTER_COMMAND: &str = "service call SurfaceFlinger 1013";

/// Substrings marking a command backend that runs but cannot answer.
pub const INTERNAL_ERROR_MARKERS: [&str; 2] = ["Parcel(Error", "does not exist"];

/// True when `output` means the introspection command is structurally broken.
pub fn is_command_failure(output: &str) -> bool {
    is_error_sentinel(output) || INTERNAL_ERROR_MARKERS.iter().any(|m| output.contains(m))
}

/// Lazily resolved, never re-probed knowledge about the device's sources.
pub struct SourceResolver {
    executor: Arc<dyn CommandExecutor>,
    counter_paths: Vec<String>,
    search_roots: Vec<String>,
    counter_command: String,
    counter_path: OnceLock<Option<String>>,
    command_probe: OnceLock<()>,
    command_available: AtomicBool,
}

impl SourceResolver {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        counter_paths: Vec<String>,
        search_roots: Vec<String>,
        counter_command: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            counter_paths,
            search_roots,
            counter_command: counter_command.into(),
            counter_path: OnceLock::new(),
            command_probe: OnceLock::new(),
            command_available: AtomicBool::new(true),
        }
    }

    pub fn from_config(executor: Arc<dyn CommandExecutor>, config: &EngineConfig) -> Self {
        Self::new(
            executor,
            config.counter_paths.clone(),
            config.search_roots.clone(),
            config.counter_command.clone(),
        )
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// Fixed counter files, tried before the resolved one.
    pub fn counter_paths(&self) -> &[String] {
        &self.counter_paths
    }

    pub fn counter_command(&self) -> &str {
        &self.counter_command
    }

    /// Best counter file on this device, resolved on first call and memoized.
    pub fn resolve_counter_path(&self) -> Option<&str> {
        self.counter_path
            .get_or_init(|| {
                let resolved = self.locate_counter_path();
                match &resolved {
                    Some(path) => info!(path = %path, "Frame counter file resolved"),
                    None => info!("No frame counter file on this device"),
                }
                resolved
            })
            .as_deref()
    }

    fn locate_counter_path(&self) -> Option<String> {
        self.counter_paths
            .iter()
            .find(|path| self.executor.exists(path))
            .cloned()
            .or_else(|| self.search_counter_file())
    }

    /// Search the configured roots for a counter file.
    pub fn search_counter_file(&self) -> Option<String> {
        if self.search_roots.is_empty() {
            return None;
        }

        let command = format!(
            "find {} -maxdepth 4 -name {} 2>/dev/null",
            self.search_roots.join(" "),
            COUNTER_FILE_NAME
        );
        let output = self.executor.execute(&command);
        if is_error_sentinel(&output) {
            debug!("Counter file search failed");
            return None;
        }

        output
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('/'))
            .find(|path| self.executor.exists(path))
            .map(str::to_string)
    }

    /// Whether the introspection command works, probed once on first call.
    pub fn probe_command_availability(&self) -> bool {
        self.command_probe.get_or_init(|| {
            if !self.command_available.load(Ordering::SeqCst) {
                return;
            }
            if self.counter_command.is_empty() {
                self.disable_command("no command configured");
                return;
            }
            let output = self.executor.execute(&self.counter_command);
            if is_command_failure(&output) {
                self.disable_command(&output);
            } else {
                debug!(command = %self.counter_command, "Introspection command available");
            }
        });
        self.is_command_available()
    }

    /// Current availability without triggering the probe.
    pub fn is_command_available(&self) -> bool {
        self.command_available.load(Ordering::SeqCst)
    }

    /// Permanently remove the introspection command from rotation.
    pub fn disable_command(&self, reason: &str) {
        if self.command_available.swap(false, Ordering::SeqCst) {
            warn!(
                command = %self.counter_command,
                reason = %reason,
                "Introspection command disabled for the rest of this session"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ERROR_SENTINEL;
    use crate::test_support::ScriptedExecutor;

    const HEALTHY_REPLY: &str = "Result: Parcel(00000e5a    '....')";

    fn resolver(executor: &Arc<ScriptedExecutor>) -> SourceResolver {
        SourceResolver::new(
            executor.clone(),
            WELL_KNOWN_COUNTER_PATHS.iter().map(|p| p.to_string()).collect(),
            DEFAULT_SEARCH_ROOTS.iter().map(|p| p.to_string()).collect(),
            DEFAULT_COUNTER_COMMAND,
        )
    }

    fn find_command() -> String {
        format!(
            "find /sys/class/drm /sys/class/graphics -maxdepth 4 -name {} 2>/dev/null",
            COUNTER_FILE_NAME
        )
    }

    #[test]
    fn test_first_well_known_path_wins() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.add_file(WELL_KNOWN_COUNTER_PATHS[0], "60");
        executor.add_file(WELL_KNOWN_COUNTER_PATHS[1], "60");

        let resolver = resolver(&executor);
        assert_eq!(resolver.resolve_counter_path(), Some(WELL_KNOWN_COUNTER_PATHS[0]));
    }

    #[test]
    fn test_second_well_known_path() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.add_file(WELL_KNOWN_COUNTER_PATHS[1], "60");

        let resolver = resolver(&executor);
        assert_eq!(resolver.resolve_counter_path(), Some(WELL_KNOWN_COUNTER_PATHS[1]));
        assert_eq!(executor.count_calls(&find_command()), 0);
    }

    #[test]
    fn test_dynamic_search_fallback() {
        let executor = Arc::new(ScriptedExecutor::new());
        let found = "/sys/class/drm/card0-DSI-1/measured_fps";
        executor.add_file(found, "fps: 90.0");
        executor.set_reply(
            &find_command(),
            "/sys/class/drm/stale/measured_fps\n/sys/class/drm/card0-DSI-1/measured_fps",
        );

        let resolver = resolver(&executor);
        assert_eq!(resolver.resolve_counter_path(), Some(found));
    }

    #[test]
    fn test_negative_result_is_never_reprobed() {
        let executor = Arc::new(ScriptedExecutor::new());
        let resolver = resolver(&executor);

        assert_eq!(resolver.resolve_counter_path(), None);
        let calls_after_first = executor.calls().len();

        for _ in 0..5 {
            assert_eq!(resolver.resolve_counter_path(), None);
        }
        assert_eq!(executor.calls().len(), calls_after_first);
        assert_eq!(executor.count_calls(&find_command()), 1);
    }

    #[test]
    fn test_search_sentinel_yields_none() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail(&find_command());
        assert_eq!(resolver(&executor).search_counter_file(), None);
    }

    #[test]
    fn test_empty_search_roots_skip_find() {
        let executor = Arc::new(ScriptedExecutor::new());
        let resolver = SourceResolver::new(
            executor.clone(),
            Vec::new(),
            Vec::new(),
            DEFAULT_COUNTER_COMMAND,
        );
        assert_eq!(resolver.resolve_counter_path(), None);
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_probe_healthy_command() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_reply(DEFAULT_COUNTER_COMMAND, HEALTHY_REPLY);

        let resolver = resolver(&executor);
        assert!(resolver.probe_command_availability());
        assert!(resolver.probe_command_availability());
        assert_eq!(executor.count_calls(DEFAULT_COUNTER_COMMAND), 1);
    }

    #[test]
    fn test_probe_sentinel_disables_command() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_reply(DEFAULT_COUNTER_COMMAND, ERROR_SENTINEL);

        let resolver = resolver(&executor);
        assert!(!resolver.probe_command_availability());
        assert!(!resolver.is_command_available());
    }

    #[test]
    fn test_probe_internal_error_disables_command() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_reply(
            DEFAULT_COUNTER_COMMAND,
            "Result: Parcel(Error: 0xffffffffffffffb6 \"Not a data message\")",
        );
        assert!(!resolver(&executor).probe_command_availability());
    }

    #[test]
    fn test_probe_missing_service_disables_command() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_reply(
            DEFAULT_COUNTER_COMMAND,
            "service: Service SurfaceFlinger does not exist",
        );
        assert!(!resolver(&executor).probe_command_availability());
    }

    #[test]
    fn test_disable_is_permanent() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_reply(DEFAULT_COUNTER_COMMAND, HEALTHY_REPLY);

        let resolver = resolver(&executor);
        resolver.disable_command("test");
        assert!(!resolver.probe_command_availability());
        assert_eq!(executor.count_calls(DEFAULT_COUNTER_COMMAND), 0);
    }

    #[test]
    fn test_empty_command_is_unavailable() {
        let executor = Arc::new(ScriptedExecutor::new());
        let resolver = SourceResolver::new(executor.clone(), Vec::new(), Vec::new(), "");
        assert!(!resolver.probe_command_availability());
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_healthy_parcel_is_not_a_failure() {
        assert!(!is_command_failure(HEALTHY_REPLY));
        assert!(is_command_failure(ERROR_SENTINEL));
    }
}
