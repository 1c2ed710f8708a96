/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod args;
mod config;

use args::{Action, AppOptions, ServeAction};
use config::{Config, Format, LogOutput};
use std::{
	borrow::Cow,
	fs::File,
	io::{self, Read},
	path::Path,
	sync::Arc,
};
use tokio::runtime::Runtime;

type BoxStdErr = Box<dyn std::error::Error + Send + Sync>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
enum Error {
	#[error("[IO error] {0}")]
	Io(#[from] io::Error),
	#[error("[input] {0}")]
	Input(Cow<'static, str>),
	#[error("[config] {0}")]
	Config(BoxStdErr),
	#[error("[runtime] {0}")]
	Runtime(BoxStdErr),
}

fn read_conf_str(path: &Path) -> Result<String, io::Error> {
	let mut conf_str = String::with_capacity(1024);
	File::open(path)?.read_to_string(&mut conf_str)?;
	Ok(conf_str)
}

fn read_config(conf_str: &str, format: Format) -> Result<Config, BoxStdErr> {
	let conf: Config = match format {
		Format::Toml => toml::from_str(conf_str)?,
		Format::Json => serde_json::from_str(conf_str)?,
	};
	Ok(conf)
}

fn serve(action: ServeAction) -> Result<(), Error> {
	let mut conf = {
		let conf_str = read_conf_str(&action.path)
			.map_err(|e| Error::Input(format!("cannot read config: {}", e).into()))?;
		read_config(&conf_str, action.format).map_err(Error::Config)?
	};

	// Command line options take precedence over the config file.
	if let Some(level) = action.coms.log {
		conf.log.level = level;
	}
	if let Some(out) = &action.coms.log_out {
		conf.log.output = LogOutput::from_str(out);
	}
	conf.log.init_logger().map_err(Error::Config)?;

	let server = Arc::new(conf.relay.build().map_err(|e| Error::Config(Box::new(e)))?);

	let rt = Runtime::new()?;
	if let Err(err) = rt.block_on(server.serve()) {
		return Err(Error::Runtime(err));
	}
	Ok(())
}

fn main() {
	let action = match AppOptions::new_from_args().into_action() {
		Ok(action) => action,
		Err(err) => {
			eprintln!("{}", err);
			std::process::exit(1);
		}
	};
	match action {
		Action::CheckVersion => println!("rusty_relay {}", VERSION),
		Action::Serve(action) => {
			if let Err(err) = serve(action) {
				eprintln!("{}", err);
				std::process::exit(1);
			}
		}
	}
}
