//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of xmppd.
//
// xmppd is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// xmppd is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// xmppd. If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use xmppd::account::user;
use xmppd::support::error::Error;

/// Create an xmppd user account directly on disk.
#[derive(StructOpt)]
#[structopt(name = "useradd", max_term_width = 80)]
struct Opt {
    /// The server's data directory
    #[structopt(short = "d", parse(from_os_str))]
    data_dir: PathBuf,

    /// Name of the account to create
    #[structopt(short = "u")]
    username: String,

    /// Password for the new account
    #[structopt(short = "p")]
    password: String,

    /// Domain, used for display only
    #[structopt(short = "D", default_value = "localhost")]
    domain: String,
}

fn main() {
    let opt = Opt::from_args();

    match user::create(&opt.data_dir, &opt.username, &opt.password) {
        Ok(()) => {
            println!(
                "User '{}@{}' created successfully.",
                opt.username, opt.domain
            );
        },
        Err(Error::InvalidUsername) => {
            eprintln!(
                "Error: invalid username '{}'. \
                 Only alphanumeric, '.', '-', '_' allowed.",
                opt.username
            );
            process::exit(1);
        },
        Err(Error::UserExists) => {
            eprintln!(
                "Error: user '{}@{}' already exists.",
                opt.username, opt.domain
            );
            process::exit(1);
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        },
    }
}
