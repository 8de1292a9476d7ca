use clap::Parser;
use reelcut::cli::Cli;

fn main() {
    reelcut::init_logger();

    if let Err(e) = reelcut::run(Cli::parse()) {
        log::error!("{e:?}");
        std::process::exit(-1);
    }
}
