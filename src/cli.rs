use std::env;

pub struct Opts {
    pub subcommand: String,
    pub task: Option<String>,
    pub files: Vec<String>,
}

pub fn get_opts() -> Opts {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: taskdock <list|docs|run> [task] [input files...]");
        std::process::exit(1);
    }
    Opts {
        subcommand: args[1].clone(),
        task: args.get(2).cloned(),
        files: args.iter().skip(3).cloned().collect(),
    }
}
