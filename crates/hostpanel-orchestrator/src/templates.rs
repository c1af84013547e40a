//! Rendered host configs: php-fpm pools and nginx server blocks.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::providers::CertificatePaths;
use crate::runtime::PhpVersion;
use crate::storage::Framework;

/// Text nginx returns for a suspended site.
pub const SUSPENDED_MESSAGE: &str = "Site has been temporarily suspended.";

/// Pool for one site, listening on its own socket.
pub fn pool_config(
    version: PhpVersion,
    domain: &str,
    project_name: &str,
    owner: &str,
    web_group: &str,
    socket: &Path,
    root: &Path,
) -> String {
    format!(
        r"[{domain}]
user = {owner}
group = {owner}
listen = {socket}
listen.owner = {web_group}
listen.group = {web_group}
listen.mode = 0660

pm = dynamic
pm.max_children = 10
pm.start_servers = 3
pm.min_spare_servers = 2
pm.max_spare_servers = 6

catch_workers_output = yes
php_admin_value[error_log] = /var/log/php{version}-fpm-{project_name}.log
php_admin_flag[log_errors] = on

chdir = {root}
",
        socket = socket.display(),
        root = root.display(),
    )
}

/// Everything a server block for a live site depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualHostSpec {
    pub domain: String,
    pub include_www: bool,
    pub document_root: PathBuf,
    pub socket: PathBuf,
    pub framework: Framework,
}

impl VirtualHostSpec {
    fn server_names(&self) -> String {
        server_names(&self.domain, self.include_www)
    }
}

fn server_names(domain: &str, include_www: bool) -> String {
    if include_www {
        format!("{domain} www.{domain}")
    } else {
        domain.to_string()
    }
}

fn try_files(framework: Framework) -> &'static str {
    match framework {
        Framework::Php => "try_files $uri $uri/ =404;",
        Framework::Laravel => "try_files $uri $uri/ /index.php?$query_string;",
        Framework::Wordpress => "try_files $uri $uri/ /index.php?$args;",
    }
}

/// `ssl_certificate` lines for a certificate.
pub fn tls_directives(cert: &CertificatePaths) -> String {
    format!(
        "    ssl_certificate {};\n    ssl_certificate_key {};\n",
        cert.fullchain.display(),
        cert.private_key.display()
    )
}

/// Body shared by the plain and TLS server blocks.
fn site_body(spec: &VirtualHostSpec) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "    root {};", spec.document_root.display());
    body.push_str("    index index.php index.html index.htm;\n");
    if spec.framework == Framework::Wordpress {
        body.push_str("    client_max_body_size 2048M;\n");
    }
    let _ = write!(
        body,
        r"
    location / {{
        {try_files}
    }}

    location ~ \.php$ {{
        include snippets/fastcgi-php.conf;
        fastcgi_pass unix:{socket};
",
        try_files = try_files(spec.framework),
        socket = spec.socket.display(),
    );
    if spec.framework == Framework::Wordpress {
        body.push_str(
            "        fastcgi_read_timeout 1800;\n        fastcgi_send_timeout 1800;\n        fastcgi_connect_timeout 1800;\n",
        );
    }
    body.push_str(
        r"    }

    location ~ /\.ht {
        deny all;
    }
",
    );
    body
}

/// Server blocks for a live site. With a certificate, port 80 redirects
/// to HTTPS and the site is served on 443.
pub fn virtual_host(spec: &VirtualHostSpec, cert: Option<&CertificatePaths>) -> String {
    let names = spec.server_names();
    let body = site_body(spec);
    match cert {
        None => format!(
            "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {names};\n\n{body}}}\n"
        ),
        Some(cert) => format!(
            "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {names};\n    return 301 https://$host$request_uri;\n}}\n\n\
             server {{\n    listen 443 ssl;\n    listen [::]:443 ssl;\n    http2 on;\n    server_name {names};\n\n{tls}\n{body}}}\n",
            tls = tls_directives(cert),
        ),
    }
}

/// `ssl_certificate*` lines from an existing config, re-indented.
pub fn extract_tls_directives(config: &str) -> Option<String> {
    let lines: Vec<&str> = config
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("ssl_certificate"))
        .collect();
    let has_cert = lines.iter().any(|l| l.starts_with("ssl_certificate "));
    let has_key = lines.iter().any(|l| l.starts_with("ssl_certificate_key "));
    (has_cert && has_key).then(|| {
        lines
            .iter()
            .map(|l| format!("    {l}\n"))
            .collect::<String>()
    })
}

/// Static 403 page served instead of the site. Certificate lines from the
/// live config are kept so HTTPS clients still get a valid handshake.
pub fn suspended_host(domain: &str, include_www: bool, live_config: Option<&str>) -> String {
    let names = server_names(domain, include_www);
    let deny = format!(
        "    location / {{\n        default_type text/plain;\n        return 403 \"{SUSPENDED_MESSAGE}\";\n    }}\n"
    );
    let mut config = format!(
        "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {names};\n\n{deny}}}\n"
    );
    if let Some(tls) = live_config.and_then(extract_tls_directives) {
        let _ = write!(
            config,
            "\nserver {{\n    listen 443 ssl;\n    listen [::]:443 ssl;\n    server_name {names};\n\n{tls}\n{deny}}}\n"
        );
    }
    config
}
