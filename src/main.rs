use structopt::StructOpt;

use arion::flags::Flags;
use arion::{ArionGroup, Baremetal, Config, Process};

fn main() {
    let flags = Flags::from_args();
    let config = Config::default()
        .with_log_lvl(flags.log_level)
        .with_thread_blocking_io(flags.blocking_io);

    let process = if flags.raw {
        let code = match std::fs::read(&flags.program_args[0]) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("arion: cannot read {}: {}", flags.program_args[0], e);
                std::process::exit(1);
            }
        };
        Process::new_baremetal_instance(
            Baremetal::new(flags.arch, code),
            &flags.rootfs,
            flags.env.clone(),
            &flags.cwd,
            config,
        )
    } else {
        Process::new_instance(
            flags.program_args.clone(),
            &flags.rootfs,
            flags.env.clone(),
            &flags.cwd,
            config,
        )
    };

    let process = match process {
        Ok(p) => p,
        Err(e) => {
            eprintln!("arion: {}", e);
            std::process::exit(1);
        }
    };

    let group = ArionGroup::new();
    group.borrow_mut().add_instance(process.clone(), None, None);
    let result = ArionGroup::run(&group);

    if flags.maps {
        let p = process.borrow();
        eprint!("{}", arion::memory::mappings_str(&p.uc));
    }

    match result {
        Ok(()) => {
            let code = process.borrow().state().run.exit_code.unwrap_or(0);
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("arion: {}", e);
            std::process::exit(1);
        }
    }
}
