use birdfeed::app::{self, Command};

fn main() {
    let command = match app::parse_command(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("error: {err}\n\n{}", app::USAGE);
            std::process::exit(2);
        }
    };

    let result = match command {
        Command::Version => {
            println!("birdfeed {}", birdfeed::VERSION);
            Ok(())
        }
        Command::Help => {
            println!("{}", app::USAGE);
            Ok(())
        }
        Command::Run(feed) => app::run(feed),
        Command::Lists => app::lists(),
        Command::Post(text) => app::post(&text),
    };
    if let Err(err) = result {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
