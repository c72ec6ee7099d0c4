//! Built-in probe prompts
//!
//! Screen-context prompts in the shape the adapter was trained on: a task
//! headline, captured screen text, and the file to modify.

use serde::Serialize;

/// A named example prompt
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExamplePrompt {
    pub name: &'static str,
    /// Whether the scenario appears in the adapter's training pairs
    pub seen_in_training: bool,
    pub text: &'static str,
}

pub const ONBOARDING_VIDEO_FIX: ExamplePrompt = ExamplePrompt {
    name: "onboarding-video-fix",
    seen_in_training: true,
    text: "release-app make onboarding stream properly screenshots

Screen Context from screenpipe - screenpipe:

screenpipescreenpipeWatch video on YouTubeError 153Video player configuration errorskip onboardingget started \u{2192}

Task: Modify screenpipe-app-tauri/components/onboarding/introduction.tsx",
};

pub const AUTH_MIDDLEWARE_FIX: ExamplePrompt = ExamplePrompt {
    name: "auth-middleware-fix",
    seen_in_training: false,
    text: "Fix authentication bug in middleware

Screen Context from VS Code - middleware.ts:

export function middleware(req: Request) {
  return NextResponse.next()
}

Task: Modify app/middleware.ts to add auth check",
};

pub const DARK_MODE_TOGGLE: ExamplePrompt = ExamplePrompt {
    name: "dark-mode-toggle",
    seen_in_training: false,
    text: "Add dark mode toggle to settings page

Screen Context from VS Code - settings.tsx:

Settings
Theme: Light
Language: English
Save Settings

Task: Modify app/settings/page.tsx",
};

/// All built-in prompts, training scenario first
pub static EXAMPLES: [ExamplePrompt; 3] =
    [ONBOARDING_VIDEO_FIX, AUTH_MIDDLEWARE_FIX, DARK_MODE_TOGGLE];

/// Look up a prompt by name or 1-based index
pub fn find(key: &str) -> Option<&'static ExamplePrompt> {
    if let Ok(index) = key.parse::<usize>() {
        return index.checked_sub(1).and_then(|i| EXAMPLES.get(i));
    }
    EXAMPLES.iter().find(|p| p.name == key)
}
