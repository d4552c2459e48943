//! Command line program for running simulation fabric workers and talking
//! to them.

#[macro_use]
extern crate log;

extern crate anyhow;
extern crate clap;
extern crate colored;

pub mod cli;

use colored::*;

fn main() {
    // Run the program based on user input
    match cli::start(cli::app_matches()) {
        Ok(_) => (),
        Err(e) => {
            println!("{}{}", "error: ".red(), e);
            if e.root_cause().to_string() != e.to_string() {
                println!("Caused by:\n{}", e.root_cause())
            }
            std::process::exit(1);
        }
    }
}
