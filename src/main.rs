fn main() -> anyhow::Result<()> {
    parley::run_cli()
}
