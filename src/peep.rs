use anyhow::{anyhow, bail, Result};

use std::collections::HashSet;

/// Bound on rewriting passes; exceeding it means a recursive rule set.
const MAX_PASS: usize = 16;
/// Initial per-rule firecount.
const MAX_FIRECOUNT: u64 = 65535;

/// One pattern/replacement rule. Pattern lines may be `%check` or
/// `%check_eval` conditions; the replacement may begin with `%once`
/// or `%activate`.
#[derive(Debug, Clone)]
struct Rule {
    pattern: Vec<String>,
    replacement: Vec<String>,
    firecount: u64,
    /// Guard against a rule re-activating with the same captures.
    activated: HashSet<Vec<Option<String>>>,
}

type Vars = [Option<String>; 10];

/// A rule-driven peephole rewriter over lines of assembly text.
/// Rules come from a text file: pattern lines, a line holding `=`,
/// replacement lines, and a line of `====` after each rule.
pub struct Peephole {
    rules: Vec<Rule>,
    next_label: u32,
    again: bool,
}

/// Evaluate an RPN expression over integers and captured variables.
/// The operators are + - * / % (spelt %%) & | ^ and the shifts < >;
/// a division or modulo by zero yields zero.
fn rpn_eval(expr: &str, vars: &Vars) -> Result<i64> {
    let mut stack: Vec<i64> = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0;

    fn pop(stack: &mut Vec<i64>) -> i64 {
        stack.pop().unwrap_or(0)
    }

    while i < bytes.len() {
        let c = bytes[i];
        i += 1;
        match c {
            b'0'..=b'9' => {
                let start = i - 1;
                let mut end = start + 1;
                // Allow hex constants
                if c == b'0' && bytes.get(end) == Some(&b'x') {
                    end += 1;
                    while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
                        end += 1;
                    }
                    let n = i64::from_str_radix(&expr[start + 2..end], 16)
                        .map_err(|_| anyhow!("Optimiser error, cannot parse number: {expr}"))?;
                    stack.push(n);
                } else {
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    let n: i64 = expr[start..end]
                        .parse()
                        .map_err(|_| anyhow!("Optimiser error, cannot parse number: {expr}"))?;
                    stack.push(n);
                }
                i = end;
            }
            b'+' => {
                let v = pop(&mut stack) + pop(&mut stack);
                stack.push(v);
            }
            b'*' => {
                let v = pop(&mut stack) * pop(&mut stack);
                stack.push(v);
            }
            b'-' => {
                let op2 = pop(&mut stack);
                let v = pop(&mut stack) - op2;
                stack.push(v);
            }
            b'|' => {
                let op2 = pop(&mut stack);
                let v = pop(&mut stack) | op2;
                stack.push(v);
            }
            b'&' => {
                let op2 = pop(&mut stack);
                let v = pop(&mut stack) & op2;
                stack.push(v);
            }
            b'>' => {
                let op2 = pop(&mut stack);
                let v = pop(&mut stack) >> op2;
                stack.push(v);
            }
            b'<' => {
                let op2 = pop(&mut stack);
                let v = pop(&mut stack) << op2;
                stack.push(v);
            }
            b'/' => {
                let op2 = pop(&mut stack);
                if op2 == 0 {
                    return Ok(0);
                }
                let v = pop(&mut stack) / op2;
                stack.push(v);
            }
            b'%' => match bytes.get(i).copied() {
                Some(d) if d.is_ascii_digit() => {
                    let var = vars[(d - b'0') as usize]
                        .as_deref()
                        .ok_or_else(|| anyhow!("Optimiser error, variable %{} is not set", d as char))?;
                    let trimmed = var.trim();
                    let n = if let Some(hex) = trimmed.strip_prefix("0x") {
                        i64::from_str_radix(hex, 16)
                    } else {
                        trimmed.parse()
                    }
                    .map_err(|_| anyhow!("Optimiser error, cannot parse variable: {var}"))?;
                    stack.push(n);
                    i += 1;
                }
                Some(b'%') => {
                    i += 1;
                    let op2 = pop(&mut stack);
                    if op2 == 0 {
                        return Ok(0);
                    }
                    let v = pop(&mut stack) % op2;
                    stack.push(v);
                }
                _ => {}
            },
            _ => {}
        }
    }
    Ok(stack.last().copied().unwrap_or(0))
}

/// Match one input line against a pattern line, capturing or checking
/// the `%0..%9` wildcards. A wildcard matches up to the character
/// that follows it in the pattern.
fn match_line(ins: &str, pat: &str, vars: &mut Vars) -> Result<bool> {
    let ins_b = ins.as_bytes();
    let pat_b = pat.as_bytes();
    let mut i = 0;
    let mut p = 0;

    while i < ins_b.len() && p < pat_b.len() {
        if pat_b[p] == b'%' && p + 1 < pat_b.len() {
            match pat_b[p + 1] {
                b'%' => {
                    if ins_b[i] != b'%' {
                        return Ok(false);
                    }
                    i += 1;
                    p += 2;
                    continue;
                }
                d @ b'0'..=b'9' => {
                    if pat_b.get(p + 2) == Some(&b'%') && pat_b.get(p + 3) != Some(&b'%') {
                        bail!("input pattern %n%m is not allowed: {pat}");
                    }
                    let delim = pat_b.get(p + 2).copied();
                    let start = i;
                    while i < ins_b.len() && Some(ins_b[i]) != delim {
                        i += 1;
                    }
                    let captured = &ins[start..i];
                    let slot = &mut vars[(d - b'0') as usize];
                    match slot {
                        None => *slot = Some(captured.to_owned()),
                        Some(prev) => {
                            if prev != captured {
                                return Ok(false);
                            }
                        }
                    }
                    p += 2;
                    continue;
                }
                _ => {}
            }
        }
        if pat_b[p] != ins_b[i] {
            return Ok(false);
        }
        p += 1;
        i += 1;
    }

    Ok(i == ins_b.len() && p == pat_b.len())
}

/// Evaluate a `%check min <= %n <= max` pattern line.
fn check(cond: &str, vars: &Vars) -> Result<bool> {
    let parts: Vec<&str> = cond.split("<=").map(str::trim).collect();
    let [min, var, max] = parts.as_slice() else {
        bail!("format is '%check min <= %n <= max', got: {cond}");
    };
    let min: i64 = min
        .parse()
        .map_err(|_| anyhow!("bad bound in %check: {cond}"))?;
    let max: i64 = max
        .parse()
        .map_err(|_| anyhow!("bad bound in %check: {cond}"))?;
    let digit = var
        .strip_prefix('%')
        .and_then(|v| v.chars().next())
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| anyhow!("format is '%check min <= %n <= max', got: {cond}"))?;

    let value = vars[digit as usize]
        .as_deref()
        .ok_or_else(|| anyhow!("variable is not set in %check: {cond}"))?;
    let Ok(value) = value.trim().parse::<i64>() else {
        return Ok(false);
    };
    Ok(min <= value && value <= max)
}

/// Evaluate a `%check_eval value = rpn` pattern line.
fn check_eval(cond: &str, vars: &Vars) -> Result<bool> {
    let Some((expected, expr)) = cond.split_once('=') else {
        bail!("format is '%check_eval result = expr', got: {cond}");
    };
    let expected: i64 = expected
        .trim()
        .parse()
        .map_err(|_| anyhow!("bad value in %check_eval: {cond}"))?;
    Ok(expected == rpn_eval(expr.trim(), vars)?)
}

impl Peephole {
    /// Parse a rules file. Rules are separated by `====` lines; the
    /// pattern and replacement inside one rule by a `=` line. Blank
    /// and `#` comment lines before a pattern are ignored.
    pub fn new(rules_text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        let mut lines = rules_text.lines().peekable();

        while lines.peek().is_some() {
            let mut pattern = Vec::new();
            let mut at_start = true;
            for line in lines.by_ref() {
                if line == "=" {
                    break;
                }
                if at_start && (line.trim().is_empty() || line.starts_with('#')) {
                    continue;
                }
                at_start = false;
                pattern.push(line.to_owned());
            }

            let mut replacement = Vec::new();
            for line in lines.by_ref() {
                if line == "====" {
                    break;
                }
                replacement.push(line.to_owned());
            }

            // Don't create empty rules
            if pattern.is_empty() {
                continue;
            }
            rules.push(Rule {
                pattern,
                replacement,
                firecount: MAX_FIRECOUNT,
                activated: HashSet::new(),
            });
        }

        Ok(Self {
            rules,
            next_label: 0,
            again: false,
        })
    }

    /// Substitute the captured variables, fresh labels and %eval
    /// expressions into a replacement line. `labels` holds the label
    /// numbers already minted for %L, %M, %N in this firing.
    fn subst(&mut self, pat: &str, vars: &Vars, labels: &mut [u32; 3]) -> Result<String> {
        let bytes = pat.as_bytes();
        let mut out = String::new();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'%' || i + 1 >= bytes.len() {
                out.push(bytes[i] as char);
                i += 1;
                continue;
            }
            match bytes[i + 1] {
                b'%' => {
                    out.push('%');
                    i += 2;
                }
                c @ b'L'..=b'N' => {
                    let idx = (c - b'L') as usize;
                    if labels[idx] == 0 {
                        self.next_label += 1;
                        labels[idx] = self.next_label;
                    }
                    out.push_str(&labels[idx].to_string());
                    i += 2;
                }
                b'e' if pat[i..].starts_with("%eval(") => {
                    let start = i + 6;
                    let end = pat[start..]
                        .find(')')
                        .map(|p| start + p)
                        .ok_or_else(|| anyhow!("unterminated %eval in: {pat}"))?;
                    let value = rpn_eval(&pat[start..end], vars)?;
                    out.push_str(&value.to_string());
                    i = end + 1;
                }
                d @ b'0'..=b'9' => {
                    let var = vars[(d - b'0') as usize]
                        .as_deref()
                        .ok_or_else(|| anyhow!("variable {} is not set in \"{pat}\"", d as char))?;
                    out.push_str(var);
                    i += 2;
                }
                _ => {
                    out.push('%');
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    /// Try to match a rule's pattern ending at line index `r`,
    /// walking the pattern backwards. Returns the index of the first
    /// matched line on success.
    fn match_rule(rule: &Rule, lines: &[String], r: usize, vars: &mut Vars) -> Result<Option<usize>> {
        let mut c = r as isize;

        for pat in rule.pattern.iter().rev() {
            if let Some(cond) = pat.strip_prefix("%check_eval") {
                if !check_eval(cond.trim(), vars)? {
                    return Ok(None);
                }
                continue;
            }
            if let Some(cond) = pat.strip_prefix("%check") {
                if !check(cond.trim(), vars)? {
                    return Ok(None);
                }
                continue;
            }
            if c < 0 {
                return Ok(None);
            }
            if !match_line(&lines[c as usize], pat, vars)? {
                return Ok(None);
            }
            c -= 1;
        }
        Ok(Some((c + 1) as usize))
    }

    /// Parse the nested rules of an %activate replacement, with the
    /// current captures substituted in.
    fn activate_rules(&mut self, body: &[String], vars: &Vars) -> Result<Vec<Rule>> {
        let mut new_rules = Vec::new();
        let mut idx = 0;

        while idx < body.len() {
            let mut labels = [0u32; 3];
            let mut pattern = Vec::new();
            while idx < body.len() && body[idx] != "=" {
                pattern.push(self.subst(&body[idx], vars, &mut labels)?);
                idx += 1;
            }
            if idx >= body.len() {
                bail!("missing '=' in activated rule");
            }
            idx += 1; // the '='

            let mut replacement = Vec::new();
            while idx < body.len() && body[idx] != "%activate" {
                replacement.push(self.subst(&body[idx], vars, &mut labels)?);
                idx += 1;
            }
            if idx < body.len() {
                idx += 1; // a further %activate
            }

            if pattern.is_empty() {
                bail!("empty pattern in activated rule");
            }
            new_rules.push(Rule {
                pattern,
                replacement,
                firecount: MAX_FIRECOUNT,
                activated: HashSet::new(),
            });
        }
        Ok(new_rules)
    }

    /// Try every rule at the window ending at line `r`. Returns the
    /// index to continue scanning from.
    fn opt_at(&mut self, lines: &mut Vec<String>, r: usize) -> Result<usize> {
        for rule_idx in 0..self.rules.len() {
            if self.rules[rule_idx].firecount < 1 {
                continue;
            }

            let mut vars: Vars = Default::default();
            let rule = self.rules[rule_idx].clone();
            let Some(start) = Self::match_rule(&rule, lines, r, &mut vars)? else {
                continue;
            };

            self.rules[rule_idx].firecount -= 1;

            let mut replacement = rule.replacement.clone();

            // %once: fire now, then never again
            if replacement.first().map(String::as_str) == Some("%once") {
                replacement.remove(0);
                self.rules[rule_idx].firecount = 0;
            }

            // %activate: ship the nested rules into the rule set,
            // guarded by a signature of the captures
            if replacement.first().map(String::as_str) == Some("%activate") {
                let sig: Vec<Option<String>> = vars.to_vec();
                if self.rules[rule_idx].activated.contains(&sig) {
                    continue;
                }
                self.rules[rule_idx].activated.insert(sig);

                let new_rules = self.activate_rules(&replacement[1..], &vars)?;
                for (n, new_rule) in new_rules.into_iter().enumerate() {
                    self.rules.insert(rule_idx + 1 + n, new_rule);
                }
                self.again = true;
                continue;
            }

            // Fire: substitute and splice the replacement in
            let mut labels = [0u32; 3];
            let mut new_lines = Vec::with_capacity(replacement.len());
            for line in &replacement {
                new_lines.push(self.subst(line, &vars, &mut labels)?);
            }
            lines.splice(start..=r, new_lines);
            return Ok(start);
        }
        Ok(r + 1)
    }

    /// Rewrite the line stream until no rule set change remains, to a
    /// bounded number of passes.
    pub fn run(&mut self, input: &str) -> Result<String> {
        let mut lines: Vec<String> = input.lines().map(String::from).collect();

        let mut pass = 0;
        loop {
            pass += 1;
            self.again = false;

            let mut i = 0;
            while i < lines.len() {
                i = self.opt_at(&mut lines, i)?;
            }

            if !self.again {
                break;
            }
            if pass >= MAX_PASS {
                bail!("maximum of {MAX_PASS} passes exceeded; check for recursive substitutions");
            }
        }

        let mut out = lines.join("\n");
        out.push('\n');
        Ok(out)
    }
}

/// Run the peephole phase over a whole assembly text.
pub fn peephole_phase(input: &str, rules_text: &str) -> Result<String> {
    let mut opt = Peephole::new(rules_text)?;
    opt.run(input)
}
