fn main() -> std::io::Result<()> { built::write_built_file() }
