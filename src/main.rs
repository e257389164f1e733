fn main() -> anyhow::Result<()> {
    impact_companion::run()
}
