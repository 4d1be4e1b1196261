use assert_cmd::Command;

pub fn codesmith_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("codesmith").expect("codesmith test binary should build")
    }
}
