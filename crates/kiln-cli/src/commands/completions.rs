use super::{CommandError, EXIT_SUCCESS};
use clap::CommandFactory;
use clap_complete::{generate, Shell};

pub fn run<C: CommandFactory>(shell: Shell) -> Result<u8, CommandError> {
    let mut cmd = C::command();
    generate(shell, &mut cmd, "kiln", &mut std::io::stdout());
    Ok(EXIT_SUCCESS)
}
