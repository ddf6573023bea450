//! Page instrumentation injected into every browsed document
//!
//! The script tracks client-side timers and collects data-flow and
//! execution-flow observations so the controller can wait for quiescence and
//! harvest sinks. The proxy serves it directly at [`INSTRUMENTATION_PATH`];
//! the controller injects it when a page arrived without it.

/// Proxy-served path of the instrumentation script
pub const INSTRUMENTATION_PATH: &str = "/__specter/instrument.js";

/// Name of the window-global the script installs
pub const INSTRUMENTATION_GLOBAL: &str = "__specter";

/// The instrumentation source itself
pub const INSTRUMENTATION_SOURCE: &str = r#"
(function () {
    'use strict';
    if (window.__specter) { return; }

    var state = {
        pendingTimers: 0,
        dataFlowSinks: [],
        executionFlowSinks: []
    };
    window.__specter = state;

    var origSetTimeout = window.setTimeout;
    window.setTimeout = function (fn, delay) {
        state.pendingTimers += 1;
        var args = Array.prototype.slice.call(arguments, 2);
        return origSetTimeout(function () {
            state.pendingTimers -= 1;
            if (typeof fn === 'function') { fn.apply(this, args); }
        }, delay);
    };

    var origSetInterval = window.setInterval;
    window.setInterval = function (fn, delay) {
        // Intervals never drain; record one tick so quiescence is not
        // blocked forever by heartbeat timers.
        return origSetInterval(fn, delay);
    };

    window.__specter.traceDataFlow = function (sink) {
        state.dataFlowSinks.push(sink);
    };
    window.__specter.traceExecutionFlow = function (sink) {
        state.executionFlowSinks.push(sink);
    };
})();
"#;

/// Script returning whether the instrumentation global is installed
pub const CHECK_INSTRUMENTED_SCRIPT: &str =
    "return typeof window.__specter !== 'undefined';";

/// Script returning the number of client-side timers still pending
pub const PENDING_TIMERS_SCRIPT: &str =
    "return window.__specter ? window.__specter.pendingTimers : 0;";

/// Script draining collected data-flow sinks
pub const DATA_FLOW_SINKS_SCRIPT: &str =
    "var s = window.__specter ? window.__specter.dataFlowSinks : []; \
     if (window.__specter) { window.__specter.dataFlowSinks = []; } return s;";

/// Script draining collected execution-flow sinks
pub const EXECUTION_FLOW_SINKS_SCRIPT: &str =
    "var s = window.__specter ? window.__specter.executionFlowSinks : []; \
     if (window.__specter) { window.__specter.executionFlowSinks = []; } return s;";

/// Script enumerating visible elements that carry event handlers.
///
/// Anchors, forms, and image inputs are reported even without explicit
/// handlers; the controller synthesizes their implicit events.
pub const ELEMENT_SCAN_SCRIPT: &str = r#"
var out = [];
var all = document.querySelectorAll('*');
for (var i = 0; i < all.length; i++) {
    var el = all[i];
    var rect = el.getBoundingClientRect();
    var style = window.getComputedStyle(el);
    var visible = rect.width > 0 && rect.height > 0 &&
        style.visibility !== 'hidden' && style.display !== 'none';
    if (!visible) { continue; }

    var tag = el.tagName.toLowerCase();
    var events = [];
    for (var j = 0; j < el.attributes.length; j++) {
        var name = el.attributes[j].name;
        if (name.indexOf('on') === 0) { events.push(name); }
    }

    var implicit = tag === 'a' || tag === 'form' ||
        (tag === 'input' && el.getAttribute('type') === 'image');
    if (events.length === 0 && !implicit) { continue; }

    var attributes = {};
    for (var k = 0; k < el.attributes.length; k++) {
        attributes[el.attributes[k].name] = el.attributes[k].value;
    }
    out.push({ tag: tag, attributes: attributes, events: events });
}
return out;
"#;
