use anyhow::Result;
use clap::{arg, ArgAction, ArgMatches, Command};

pub fn subcmd<'help>() -> Command<'help> {
    Command::new("config")
        .about("print the effective configuration")
        .arg(
            arg!( -p --pretty "set to pretty print the configuration")
                .action(ArgAction::SetTrue),
        )
}

pub async fn cmd(data: &mut super::CmdData, m: &ArgMatches) -> Result<()> {
    let pretty = *m.get_one::<bool>("pretty").unwrap();
    if pretty {
        println!("{}", serde_json::to_string_pretty(&data.config)?)
    } else {
        println!("{}", serde_json::to_string(&data.config)?)
    }
    Ok(())
}
