//! Reference Arbor server used by the harness's own tests

fn main() -> anyhow::Result<()> {
    arbor_stub::run_cli()
}
