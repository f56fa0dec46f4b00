use std::env;
use std::io;
use std::process::ExitCode;

use viewer_ctl::{parse_cli, resolve_default_port, run, PORT_ENV_VAR};

fn main() -> ExitCode {
    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::from(1)
        }
    }
}

fn run_cli() -> Result<(), String> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    let default_port = resolve_default_port(env::var(PORT_ENV_VAR).ok().as_deref());
    let Some((request, options)) =
        parse_cli(&args, default_port).map_err(|error| format!("{error}\n\n{}", usage_text()))?
    else {
        println!("{}", usage_text());
        return Ok(());
    };

    run(&request, options, &mut io::stdout())
}

fn usage_text() -> String {
    [
        "viewer_ctl - control-port client for a running viewer",
        "",
        "Usage:",
        "  viewer_ctl [options] wait-ready",
        "  viewer_ctl [options] status",
        "  viewer_ctl [options] quit",
        "  viewer_ctl [options] send <command...>",
        "",
        "Options:",
        "  --port <u16>        control port (default: $VIEWER_CONTROL_PORT or 47001)",
        "  --timeout-ms <u64>  overall deadline (default 5000)",
        "  --retry-ms <u64>    first reconnect delay, doubled per attempt up to 1000 (default 100)",
        "  --quiet-ms <u64>    `send` stops after this long without output (default 250)",
        "",
        "Commands understood by the viewer:",
        "  quit, abort_quit, disconnect, status, sync, upload [n],",
        "  dialog_open, dialog_close, floater_open, floater_close, blur, focus",
    ]
    .join("\n")
}
