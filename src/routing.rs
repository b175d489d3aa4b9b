//! Point-to-point audio routes between client processes.
//!
//! Routes are keyed by process id rather than client id: one application can
//! hold several client connections, and routing belongs to the application.

use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Directed, gain-weighted link from one process's audio to another's.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Route {
    /// Process whose captured audio is forwarded.
    pub source_pid: i32,
    /// Process whose output receives it.
    pub dest_pid: i32,
    /// Linear gain applied to the forwarded audio.
    pub gain: f32,
    /// Disabled routes are kept but not mixed.
    pub enabled: bool,
}

impl Route {
    /// Whether this route touches `pid` at either end.
    pub fn references(&self, pid: i32) -> bool {
        self.source_pid == pid || self.dest_pid == pid
    }
}

/// One entry of a bulk route update. Entries missing a required field are skipped.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RouteUpdate {
    /// Source process id.
    pub source_pid: Option<i32>,
    /// Destination process id.
    pub dest_pid: Option<i32>,
    /// Linear gain. Defaults to unity when absent.
    pub gain: Option<f32>,
    /// Enabled flag.
    pub enabled: Option<bool>,
}

impl RouteUpdate {
    /// Fully specified update.
    pub fn new(source_pid: i32, dest_pid: i32, gain: f32, enabled: bool) -> Self {
        Self {
            source_pid: Some(source_pid),
            dest_pid: Some(dest_pid),
            gain: Some(gain),
            enabled: Some(enabled),
        }
    }

    /// Resolve into a validated route, or explain what is wrong with it.
    pub fn resolve(&self) -> EngineResult<Route> {
        let source_pid = self.source_pid.ok_or(EngineError::MissingField("source_pid"))?;
        let dest_pid = self.dest_pid.ok_or(EngineError::MissingField("dest_pid"))?;
        let enabled = self.enabled.ok_or(EngineError::MissingField("enabled"))?;
        let gain = self.gain.unwrap_or(1.0);
        validate_route(source_pid, dest_pid, gain)?;
        Ok(Route {
            source_pid,
            dest_pid,
            gain,
            enabled,
        })
    }
}

/// Check the fields of a route before it enters the graph.
pub fn validate_route(source_pid: i32, dest_pid: i32, gain: f32) -> EngineResult<()> {
    if source_pid < 0 {
        return Err(EngineError::InvalidPid(source_pid));
    }
    if dest_pid < 0 {
        return Err(EngineError::InvalidPid(dest_pid));
    }
    if !gain.is_finite() || gain < 0.0 {
        return Err(EngineError::OutOfRange {
            field: "route gain",
            value: gain as f64,
        });
    }
    Ok(())
}

/// Ordered list of routes, at most one per `(source, destination)` pair.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutingGraph {
    routes: Vec<Route>,
}

impl RoutingGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update the route for a pair. Returns whether anything changed.
    ///
    /// A new pair is only added when `enabled`; disabling a pair that has no
    /// route is a no-op.
    pub fn set_route(&mut self, source_pid: i32, dest_pid: i32, gain: f32, enabled: bool) -> bool {
        if let Some(route) = self
            .routes
            .iter_mut()
            .find(|r| r.source_pid == source_pid && r.dest_pid == dest_pid)
        {
            if route.gain == gain && route.enabled == enabled {
                return false;
            }
            route.gain = gain;
            route.enabled = enabled;
            debug!(source_pid, dest_pid, gain, enabled, "route updated");
            return true;
        }
        if !enabled {
            return false;
        }
        self.routes.push(Route {
            source_pid,
            dest_pid,
            gain,
            enabled,
        });
        debug!(source_pid, dest_pid, gain, "route added");
        true
    }

    /// Remove every route with `pid` at either end. Returns how many were removed.
    pub fn clear_routes_for(&mut self, pid: i32) -> usize {
        let before = self.routes.len();
        self.routes.retain(|route| !route.references(pid));
        before - self.routes.len()
    }

    /// Whether `pid` is the source of at least one enabled route.
    pub fn is_enabled_source(&self, pid: i32) -> bool {
        self.routes
            .iter()
            .any(|route| route.enabled && route.source_pid == pid)
    }

    /// All routes in insertion order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Number of routes, enabled or not.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no routes exist.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
