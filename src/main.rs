use clap::Parser;
use log::info;

use cdbtiler::cdb::SidecarContent;
use cdbtiler::cli::Cli;
use cdbtiler::converter::Converter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut converter = Converter::new(
        &cli.input,
        &cli.output,
        cli.converter_options(),
        SidecarContent,
    );
    // Dataset specs are validated before any conversion work starts
    for combination in cli.combinations() {
        converter.combine_dataset(&combination)?;
    }
    converter.convert()?;
    info!("conversion finished, output in {:?}", &cli.output);
    Ok(())
}
