mod cmd;

use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
/// Tools for working with Comfy and DIVA asset containers.
struct TopLevel {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum SubCommand {
    Archive(cmd::archive::Args),
    Farc(cmd::farc::Args),
    Obj(cmd::obj::Args),
    Txp(cmd::txp::Args),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .format_level(false)
        .init();

    let args: TopLevel = argh::from_env();
    let result = match args.command {
        SubCommand::Archive(args) => cmd::archive::run(args),
        SubCommand::Farc(args) => cmd::farc::run(args),
        SubCommand::Obj(args) => cmd::obj::run(args),
        SubCommand::Txp(args) => cmd::txp::run(args),
    };
    if let Err(e) = result {
        eprintln!("Failed: {e:?}");
        std::process::exit(1);
    }
}
