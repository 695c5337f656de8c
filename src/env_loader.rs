use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotenvLoadOutcome {
    LoadedDefault,
    LoadedFallback(PathBuf),
    Missing,
}

fn fallback_dotenv_path(
    floorsum_home: Option<PathBuf>,
    home_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    match floorsum_home {
        Some(dir) if !dir.as_os_str().is_empty() => Some(dir.join(".env")),
        _ => home_dir.map(|home| home.join(".floorsum").join(".env")),
    }
}

pub fn load_dotenv() -> DotenvLoadOutcome {
    if dotenvy::dotenv().is_ok() {
        return DotenvLoadOutcome::LoadedDefault;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("FLOORSUM_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return DotenvLoadOutcome::Missing;
    };
    if path.is_file() && dotenvy::from_path(&path).is_ok() {
        return DotenvLoadOutcome::LoadedFallback(path);
    }

    DotenvLoadOutcome::Missing
}

#[cfg(test)]
mod tests {
    use super::fallback_dotenv_path;
    use std::path::PathBuf;

    #[test]
    fn fallback_prefers_floorsum_home() {
        let got = fallback_dotenv_path(
            Some(PathBuf::from("/workspace")),
            Some(PathBuf::from("/home/alice")),
        );
        assert_eq!(got, Some(PathBuf::from("/workspace/.env")));
    }

    #[test]
    fn fallback_uses_dot_dir_under_home_when_unset() {
        let got = fallback_dotenv_path(None, Some(PathBuf::from("/home/alice")));
        assert_eq!(got, Some(PathBuf::from("/home/alice/.floorsum/.env")));
    }
}
