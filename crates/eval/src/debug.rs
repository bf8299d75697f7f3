//! Structured stderr dumps for `-D stat`, `-D search`, and `-D rates`.

use std::io::Write;

use bfind_walk::{WalkAction, WalkEvent, WalkOptions};

use crate::ctx::Context;

fn action_name(action: WalkAction) -> &'static str {
    match action {
        WalkAction::Continue => "CONTINUE",
        WalkAction::Prune => "PRUNE",
        WalkAction::Stop => "STOP",
    }
}

fn flag_names(flags: bfind_walk::WalkFlags) -> String {
    let names: Vec<&str> = flags.iter_names().map(|(name, _)| name).collect();
    if names.is_empty() {
        "0".to_string()
    } else {
        names.join(" | ")
    }
}

/// Logs the stat calls an event actually performed.
pub(crate) fn dump_stats(event: &WalkEvent<'_>) {
    let mut stderr = std::io::stderr().lock();
    for (follow, label) in [(true, "TRYFOLLOW"), (false, "NOFOLLOW")] {
        if let Some(result) = event.cached_stat(follow) {
            let (rc, errno) = match result {
                Ok(_) => (0, None),
                Err(code) => (-1, Some(code)),
            };
            let _ = write!(
                stderr,
                "bfind_stat(AT_FDCWD, \"{}\", {label}) == {rc}",
                event.path().display()
            );
            let _ = match errno {
                Some(code) => writeln!(stderr, " [{code}]"),
                None => writeln!(stderr),
            };
        }
    }
}

/// Logs one traversal callback decision.
pub(crate) fn dump_visit(event: &WalkEvent<'_>, action: WalkAction) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "callback({{");
    let _ = writeln!(stderr, "\t.path = \"{}\",", event.path().display());
    let _ = writeln!(stderr, "\t.root = \"{}\",", event.root().display());
    let _ = writeln!(stderr, "\t.depth = {},", event.depth());
    let _ = writeln!(stderr, "\t.visit = {},", event.visit().name());
    let _ = writeln!(stderr, "\t.typeflag = {},", event.kind().name());
    let _ = writeln!(
        stderr,
        "\t.error = {},",
        event.error().and_then(|e| e.raw_os_error()).unwrap_or(0)
    );
    let _ = writeln!(stderr, "}}) == {}", action_name(action));
}

/// Logs the traversal configuration before the walk starts.
pub(crate) fn dump_walk_config(ctx: &Context, options: &WalkOptions) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "walk({{");
    let _ = writeln!(stderr, "\t.paths = {{");
    for path in &ctx.paths {
        let _ = writeln!(stderr, "\t\t\"{}\",", path.display());
    }
    let _ = writeln!(stderr, "\t}},");
    let _ = writeln!(stderr, "\t.nopenfd = {},", options.nopenfd);
    let _ = writeln!(stderr, "\t.flags = {},", flag_names(options.flags));
    let _ = writeln!(stderr, "\t.strategy = {},", options.strategy.name());
    let _ = writeln!(stderr, "}})");
}

/// Dumps the expression tree with per-node counters after the traversal.
pub(crate) fn dump_rates(ctx: &Context) {
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(ctx.expr.dump(true).as_bytes());
}
