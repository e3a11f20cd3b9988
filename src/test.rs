use rstest::rstest;

use std::io::Cursor;

use crate::ast::fold::optimise;
use crate::ast::serial::{AstLoader, AstWriter};
use crate::ast::{Op, TreeBuilder};
use crate::driver::compile_to_text;
use crate::parse::Parser;
use crate::peep::peephole_phase;
use crate::scan::{scan_phase, Scanner};
use crate::sym::record::{load_symtab, write_symtab};
use crate::sym::{SymClass, SymKind};
use crate::token::{Token, TokenKind};
use crate::types::{modify_type, Prim};
use crate::*;

fn scan_tokens(src: &str) -> Vec<Token> {
    let mut scanner = Scanner::new(src.as_bytes());
    let mut tokens = Vec::new();
    loop {
        let tok = scanner.next_token().unwrap();
        if tok.kind == TokenKind::Eof {
            return tokens;
        }
        tokens.push(tok);
    }
}

fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
    tokens.iter().map(|t| t.kind).collect()
}

type TestParser = Parser<Cursor<Vec<u8>>, Vec<u8>>;

/// Scan and parse a source string, returning the parser so tests can
/// inspect the symbol table.
fn parse_source(src: &str, target: Target) -> anyhow::Result<TestParser> {
    let mut tokens = Vec::new();
    scan_phase(src.as_bytes(), &mut tokens)?;
    let mut parser = Parser::new(Cursor::new(tokens), Vec::new(), target)?;
    parser.global_declarations()?;
    Ok(parser)
}

#[test]
fn scan_basic_tokens() {
    use TokenKind::*;
    let toks = scan_tokens("int main(void) { return(0); }");
    assert_eq!(
        kinds(&toks),
        vec![
            Int, Ident, LParen, Void, RParen, LBrace, Return, LParen, IntLit, RParen, Semi,
            RBrace
        ]
    );
    assert_eq!(toks[1].text.as_deref(), Some("main"));
}

#[test]
fn scan_operators() {
    use TokenKind::*;
    let toks = scan_tokens("a += b >> 2 && c->d ... != <=");
    assert_eq!(
        kinds(&toks),
        vec![Ident, AsPlus, Ident, RShift, IntLit, LogAnd, Ident, Arrow, Ident, Ellipsis, Ne, Le]
    );
}

#[test]
fn scan_char_escapes() {
    let toks = scan_tokens(r"'\n' '\t' '\101' '\x41' 'a'");
    let values: Vec<i32> = toks.iter().map(|t| t.value).collect();
    assert_eq!(values, vec![10, 9, 65, 65, 97]);
}

#[test]
fn scan_string_concatenation() {
    let toks = scan_tokens("\"Hello, \" \"world\\n\"");
    assert_eq!(toks.len(), 1);
    assert_eq!(toks[0].kind, TokenKind::StrLit);
    assert_eq!(toks[0].text.as_deref(), Some("Hello, world\n"));
}

#[test]
fn scan_radix() {
    let toks = scan_tokens("10 010 0x1f 0");
    let values: Vec<i32> = toks.iter().map(|t| t.value).collect();
    assert_eq!(values, vec![10, 8, 31, 0]);
}

#[test]
fn scan_bad_digit_is_fatal() {
    let mut scanner = Scanner::new("09".as_bytes());
    assert!(scanner.next_token().is_err());
}

#[test]
fn scan_minus_folds_only_in_literal_position() {
    use TokenKind::*;
    // After a value, '-' is the binary operator
    let toks = scan_tokens("x - 5");
    assert_eq!(kinds(&toks), vec![Ident, Minus, IntLit]);
    assert_eq!(toks[2].value, 5);

    // After '=', it is the sign of the literal
    let toks = scan_tokens("x = -5;");
    assert_eq!(kinds(&toks), vec![Ident, Assign, IntLit, Semi]);
    assert_eq!(toks[2].value, -5);
}

#[test]
fn scan_line_markers() {
    use TokenKind::*;
    let toks = scan_tokens("# 7 \"t.c\"\nx");
    assert_eq!(kinds(&toks), vec![Filename, LineNum, Ident]);
    assert_eq!(toks[0].text.as_deref(), Some("t.c"));
    assert_eq!(toks[1].value, 7);

    // System header markers are ignored
    let toks = scan_tokens("# 1 \"<built-in>\"\nx");
    assert_eq!(kinds(&toks), vec![Ident]);
}

#[test]
fn token_file_round_trip() {
    let src = "int x = 10; char *s = \"hi\";";
    let original = scan_tokens(src);

    let mut bytes = Vec::new();
    scan_phase(src.as_bytes(), &mut bytes).unwrap();

    let mut input = &bytes[..];
    let mut reread = Vec::new();
    while let Some(tok) = crate::token::read_token(&mut input).unwrap() {
        reread.push(tok);
    }
    assert_eq!(original, reread);
}

#[test]
fn prim_encoding() {
    let p = Prim::INT.pointer_to().unwrap();
    assert!(p.is_ptr());
    assert_eq!(p.indirection(), 1);
    assert_eq!(p.value_at().unwrap(), Prim::INT);
    assert_eq!(Prim::from_raw(p.into_raw()).unwrap(), p);

    assert!(Prim::INT.value_at().is_err());

    let mut p = Prim::CHAR;
    for _ in 0..15 {
        p = p.pointer_to().unwrap();
    }
    assert!(p.pointer_to().is_err());
}

#[test]
fn target_manifests() {
    assert_eq!(Target::Qbe.prim_size(Prim::INT).unwrap(), 4);
    assert_eq!(Target::Qbe.prim_size(Prim::LONG).unwrap(), 8);
    assert_eq!(
        Target::Qbe.prim_size(Prim::CHAR.pointer_to().unwrap()).unwrap(),
        8
    );
    assert_eq!(Target::M6809.prim_size(Prim::INT).unwrap(), 2);
    assert_eq!(Target::M6809.prim_size(Prim::LONG).unwrap(), 4);
    assert_eq!(
        Target::M6809.prim_size(Prim::INT.pointer_to().unwrap()).unwrap(),
        2
    );

    // 4-byte alignment on the large target, none on the 6809
    assert_eq!(Target::Qbe.align(Prim::INT, 1, 1), 4);
    assert_eq!(Target::Qbe.align(Prim::CHAR, 1, 1), 1);
    assert_eq!(Target::M6809.align(Prim::INT, 1, 1), 1);
}

#[test]
fn fold_binary_literals() {
    let mut tb = TreeBuilder::new();
    let l = tb.leaf(Op::IntLit, Prim::INT, None, None, 6, 1);
    let r = tb.leaf(Op::IntLit, Prim::INT, None, None, 7, 1);
    let tree = tb.node(Op::Multiply, Prim::INT, None, Some(l), None, Some(r), None, 0, 1);

    let folded = optimise(tree, &mut tb);
    assert_eq!(folded.op, Op::IntLit);
    assert_eq!(folded.value, 42);
}

#[test]
fn fold_leaves_division_by_zero() {
    let mut tb = TreeBuilder::new();
    let l = tb.leaf(Op::IntLit, Prim::INT, None, None, 6, 1);
    let r = tb.leaf(Op::IntLit, Prim::INT, None, None, 0, 1);
    let tree = tb.node(Op::Divide, Prim::INT, None, Some(l), None, Some(r), None, 0, 1);

    let folded = optimise(tree, &mut tb);
    assert_eq!(folded.op, Op::Divide);
}

#[test]
fn fold_unary_literals() {
    let mut tb = TreeBuilder::new();
    let l = tb.leaf(Op::IntLit, Prim::INT, None, None, 3, 1);
    let tree = tb.unary(Op::Scale, Prim::INT, None, l, None, 8, 1);
    let folded = optimise(tree, &mut tb);
    assert_eq!(folded.op, Op::IntLit);
    assert_eq!(folded.value, 24);

    let l = tb.leaf(Op::IntLit, Prim::INT, None, None, 0, 1);
    let tree = tb.unary(Op::LogNot, Prim::INT, None, l, None, 0, 1);
    let folded = optimise(tree, &mut tb);
    assert_eq!(folded.value, 1);
}

#[test]
fn modify_type_widens_and_scales() {
    let mut tb = TreeBuilder::new();

    // char widens to int
    let tree = tb.leaf(Op::IntLit, Prim::CHAR, None, None, 7, 1);
    let (tree, ok) = modify_type(tree, Prim::INT, None, None, &mut tb, Target::Qbe).unwrap();
    assert!(ok);
    assert_eq!(tree.op, Op::Widen);
    assert_eq!(tree.prim, Prim::INT);

    // int does not narrow to char
    let tree = tb.leaf(Op::IntLit, Prim::INT, None, None, 1000, 1);
    let (_, ok) = modify_type(tree, Prim::CHAR, None, None, &mut tb, Target::Qbe).unwrap();
    assert!(!ok);

    // an int added to an int pointer is scaled by 4
    let int_ptr = Prim::INT.pointer_to().unwrap();
    let tree = tb.leaf(Op::IntLit, Prim::INT, None, None, 2, 1);
    let (tree, ok) =
        modify_type(tree, int_ptr, None, Some(Op::Add), &mut tb, Target::Qbe).unwrap();
    assert!(ok);
    assert_eq!(tree.op, Op::Scale);
    assert_eq!(tree.value, 4);

    // pointers of different types don't assign
    let char_ptr = Prim::CHAR.pointer_to().unwrap();
    let tree = tb.leaf(Op::Ident, char_ptr, None, None, 0, 1);
    let (_, ok) = modify_type(tree, int_ptr, None, None, &mut tb, Target::Qbe).unwrap();
    assert!(!ok);
}

#[test]
fn struct_layout_on_the_large_target() {
    let parser = parse_source(
        "struct P { char a; int b; long c; }; struct P p; int main(void) { return(0); }",
        Target::Qbe,
    )
    .unwrap();

    let p = parser.syms.find_struct("P").unwrap();
    let offsets: Vec<i64> = p.members.iter().map(|m| m.posn).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
    assert_eq!(p.size, 16);

    // No overlap, and the size covers the last member
    for pair in p.members.windows(2) {
        assert!(pair[0].posn + pair[0].size <= pair[1].posn);
    }
}

#[test]
fn struct_layout_on_the_6809() {
    let parser = parse_source(
        "struct P { char a; int b; long c; }; struct P p; int main(void) { return(0); }",
        Target::M6809,
    )
    .unwrap();
    let p = parser.syms.find_struct("P").unwrap();
    let offsets: Vec<i64> = p.members.iter().map(|m| m.posn).collect();
    assert_eq!(offsets, vec![0, 1, 3]);
    assert_eq!(p.size, 7);
}

#[test]
fn union_members_share_offset_zero() {
    let parser = parse_source(
        "union U { char a; int b; long c; }; union U u; int main(void) { return(0); }",
        Target::Qbe,
    )
    .unwrap();
    let u = parser.syms.find_union("U").unwrap();
    assert!(u.members.iter().all(|m| m.posn == 0));
    assert_eq!(u.size, 8);
}

#[test]
fn enum_values_count_up() {
    let parser = parse_source(
        "enum E { A, B, C = 10, D }; int main(void) { return(B); }",
        Target::Qbe,
    )
    .unwrap();
    assert_eq!(parser.syms.find_enum_value("A").unwrap().posn, 0);
    assert_eq!(parser.syms.find_enum_value("B").unwrap().posn, 1);
    assert_eq!(parser.syms.find_enum_value("C").unwrap().posn, 10);
    assert_eq!(parser.syms.find_enum_value("D").unwrap().posn, 11);
}

#[test]
fn extern_promotes_to_global() {
    let parser =
        parse_source("extern int x; int x; int main(void) { return(x); }", Target::Qbe).unwrap();
    let x = parser.syms.find_global("x").unwrap();
    assert_eq!(x.class, SymClass::Global);

    // And the other way around
    let parser =
        parse_source("int x; extern int x; int main(void) { return(x); }", Target::Qbe).unwrap();
    assert_eq!(
        parser.syms.find_global("x").unwrap().class,
        SymClass::Global
    );

    // A type mismatch in the pair is fatal
    assert!(parse_source("extern int x; char x;", Target::Qbe).is_err());
    // As is a plain duplicate
    assert!(parse_source("int x; int x;", Target::Qbe).is_err());
}

#[test]
fn parser_rejects_misplaced_statements() {
    assert!(parse_source("int main(void) { break; return(0); }", Target::Qbe).is_err());
    assert!(parse_source("int main(void) { continue; return(0); }", Target::Qbe).is_err());
    assert!(parse_source(
        "int f(int x) { switch(x) { case 1: return(1); case 1: return(2); } }",
        Target::Qbe
    )
    .is_err());
    assert!(parse_source(
        "int f(int x) { switch(x) { default: return(1); case 1: return(2); } }",
        Target::Qbe
    )
    .is_err());
    // A non-void function must end in a return
    assert!(parse_source("int main(void) { 1 + 2; }", Target::Qbe).is_err());
}

#[test]
fn prototype_and_definition_must_agree() {
    assert!(parse_source(
        "int f(int a); int f(char a) { return(0); } int main(void) { return(f(1)); }",
        Target::Qbe
    )
    .is_err());
    assert!(parse_source(
        "int f(int a); int f(int a, int b) { return(0); } int main(void) { return(0); }",
        Target::Qbe
    )
    .is_err());
    assert!(parse_source(
        "int f(int a); int f(int a) { return(a); } int main(void) { return(f(1)); }",
        Target::Qbe
    )
    .is_ok());
}

#[test]
fn variadic_functions_are_flagged() {
    let parser = parse_source(
        "int printf(char *fmt, ...); int main(void) { return(0); }",
        Target::Qbe,
    )
    .unwrap();
    let f = parser.syms.find_global("printf").unwrap();
    assert!(f.variadic);
    assert_eq!(f.nelems, 1);
}

#[test]
fn array_initialiser_fills_with_zeroes() {
    let parser = parse_source(
        "int a[5] = { 1, 2, 3 }; int main(void) { return(0); }",
        Target::Qbe,
    )
    .unwrap();
    let a = parser.syms.find_global("a").unwrap();
    assert_eq!(a.nelems, 5);
    assert_eq!(a.size, 20);
    assert_eq!(a.init_list, Some(vec![1, 2, 3, 0, 0]));

    // Too many values is fatal
    assert!(parse_source("int a[2] = { 1, 2, 3 };", Target::Qbe).is_err());
}

#[test]
fn symbol_file_round_trip() {
    let parser = parse_source(
        "struct P { char a; int b; }; struct P p; int g = 7; char *s = \"hey\"; \
         int add(int x, int y) { int z; z = x + y; return(z); }",
        Target::Qbe,
    )
    .unwrap();

    let mut bytes = Vec::new();
    write_symtab(&mut bytes, &parser.syms).unwrap();

    let reloaded = load_symtab(&mut &bytes[..], Target::Qbe).unwrap();
    assert_eq!(parser.syms.globals, reloaded.globals);
    assert_eq!(parser.syms.types, reloaded.types);
}

#[test]
fn ast_file_round_trip() {
    // Parse a function and stream its AST to a file
    let src = "int add(int x, int y) { return(x + y); }";
    let mut tokens = Vec::new();
    scan_phase(src.as_bytes(), &mut tokens).unwrap();

    let serial = std::process::id();
    let ast_path = std::env::temp_dir().join(format!("mcc_rt_ast_{serial}"));
    let idx_path = std::env::temp_dir().join(format!("mcc_rt_idx_{serial}"));

    let mut ast_bytes = Vec::new();
    {
        let mut parser = Parser::new(Cursor::new(tokens), &mut ast_bytes, Target::Qbe).unwrap();
        parser.global_declarations().unwrap();
        parser.ast.finish().unwrap();
    }
    std::fs::write(&ast_path, &ast_bytes).unwrap();

    let mut loader = AstLoader::open(&ast_path, &idx_path).unwrap();
    let root = loader.next_function().unwrap().expect("one function");
    assert_eq!(root.op, Op::Function);
    assert_eq!(root.name.as_deref(), Some("add"));

    // The function body is reachable through the child ids
    let body = loader.load_child(root.left_id).unwrap().unwrap();
    assert_eq!(body.op, Op::Return);
    let sum = loader.load_child(body.left_id).unwrap().unwrap();
    assert_eq!(sum.op, Op::Add);

    // Loading by id gives back the same record
    let again = loader.load_node(sum.id).unwrap();
    assert_eq!(sum, again);

    assert!(loader.next_function().unwrap().is_none());

    let _ = std::fs::remove_file(&ast_path);
    let _ = std::fs::remove_file(&idx_path);
}

#[test]
fn ast_writer_emits_node_before_children() {
    let mut tb = TreeBuilder::new();
    let l = tb.leaf(Op::IntLit, Prim::INT, None, None, 1, 1);
    let r = tb.leaf(Op::IntLit, Prim::INT, None, None, 2, 1);
    let tree = tb.node(Op::Add, Prim::INT, None, Some(l), None, Some(r), None, 0, 1);

    let mut bytes = Vec::new();
    let mut writer = AstWriter::new(&mut bytes);
    writer.write_tree(&tree).unwrap();

    // The parent has the highest id but is serialised first
    assert_eq!(bytes[4..8], (tree.id.0).to_le_bytes());
}

#[rstest]
#[case(Target::Qbe)]
#[case(Target::M6809)]
fn scenario_fibonacci(#[case] target: Target) {
    let text = compile_to_text(
        "int fib(int n) { if (n<2) return (n); return (fib(n-1)+fib(n-2)); }\n\
         int main(void) { return (fib(10)); }",
        target,
    )
    .unwrap();
    match target {
        Target::Qbe => {
            assert!(text.contains("export function w $fib("));
            assert!(text.contains("call $fib("));
            assert!(text.contains("export function w $main("));
        }
        Target::M6809 => {
            assert!(text.contains("_fib:"));
            assert!(text.contains("\tlbsr _fib"));
            assert!(text.contains("_main:"));
        }
    }
}

#[rstest]
#[case(Target::Qbe)]
#[case(Target::M6809)]
fn scenario_string_concatenation(#[case] target: Target) {
    let text = compile_to_text(
        "int printf(char *s);\nint main(void) { printf(\"Hello, \" \"world\\n\"); return (0); }",
        target,
    )
    .unwrap();
    match target {
        Target::Qbe => {
            assert!(text.contains("call $printf("));
            // 'H' then ... then the newline in the literal data
            assert!(text.contains("b 72,"));
            assert!(text.contains("b 10,  b 0 }"));
        }
        Target::M6809 => {
            assert!(text.contains("\tlbsr _printf"));
            assert!(text.contains("\t.byte\t72"));
        }
    }
}

#[rstest]
#[case(Target::Qbe, "copy 16")]
#[case(Target::M6809, "#7")]
fn scenario_sizeof_struct(#[case] target: Target, #[case] needle: &str) {
    let text = compile_to_text(
        "struct P { char a; int b; long c; }; int main(void){ return (sizeof(struct P)); }",
        target,
    )
    .unwrap();
    assert!(text.contains(needle), "missing {needle} in:\n{text}");
}

#[rstest]
#[case(Target::Qbe)]
#[case(Target::M6809)]
fn scenario_array_initialiser(#[case] target: Target) {
    let text = compile_to_text(
        "int a[5] = { 1,2,3 }; int main(void){ return (a[0]+a[4]); }",
        target,
    )
    .unwrap();
    match target {
        Target::Qbe => {
            assert!(text.contains("export data $a ="));
            assert!(text.contains("w 1, w 2, w 3, w 0, w 0, }"));
        }
        Target::M6809 => {
            assert!(text.contains("\t.export _a"));
            assert!(text.contains("\t.word\t3\n\t.word\t0\n\t.word\t0\n"));
        }
    }
}

#[rstest]
#[case(Target::Qbe)]
#[case(Target::M6809)]
fn scenario_switch(#[case] target: Target) {
    let text = compile_to_text(
        "int f(int x){ switch(x){ case 1: case 2: return (10); case 3: return (20); \
         default: return (30); } }\n\
         int main(void){ return (f(2)+f(3)+f(9)); }",
        target,
    )
    .unwrap();
    match target {
        Target::Qbe => {
            // A compare-and-branch chain, one test per case
            assert!(text.matches("ceqw").count() >= 3);
        }
        Target::M6809 => {
            // A jump table: case count, pairs, default, helper call
            assert!(text.contains("\t.word 3\n"));
            assert!(text.contains("\tlbra __switch"));
        }
    }
}

#[rstest]
#[case(Target::Qbe)]
#[case(Target::M6809)]
fn scenario_pointer_arithmetic(#[case] target: Target) {
    let text = compile_to_text(
        "int a[3] = {7,8,9}; int main(void){ int *p; p = a; p = p + 2; return (*p); }",
        target,
    )
    .unwrap();
    match target {
        Target::Qbe => {
            // The literal index folds to an 8-byte offset, 2 × the
            // 4-byte element size
            assert!(text.contains("copy 8"));
            assert!(text.contains("loadsw"));
        }
        Target::M6809 => {
            // 2-byte elements: a folded 4-byte offset
            assert!(text.contains("\taddd #4"));
            assert!(text.contains("\tldd 0,x"));
        }
    }
}

#[rstest]
#[case(Target::Qbe)]
#[case(Target::M6809)]
fn variable_index_scales_with_a_shift(#[case] target: Target) {
    let text = compile_to_text(
        "int a[3] = {7,8,9}; int f(int i) { return (a[i]); }\n\
         int main(void){ return (f(1)); }",
        target,
    )
    .unwrap();
    match target {
        Target::Qbe => {
            // The index widens to address width and shifts by 2
            assert!(text.contains("extsw"));
            assert!(text.contains("shl"));
        }
        Target::M6809 => {
            // One shift left for the 2-byte elements
            assert!(text.contains("\taslb"));
        }
    }
}

#[test]
fn long_arithmetic_uses_helpers_on_the_6809() {
    let text = compile_to_text(
        "long a; long b; int main(void) { long c; c = a * b; c = a / b; c = a % b; \
         c = a << b; return (0); }",
        Target::M6809,
    )
    .unwrap();
    for helper in ["__mull", "__divl", "__reml", "__shll"] {
        assert!(text.contains(helper), "missing {helper}");
    }
}

#[test]
fn long_comparison_is_correct_on_the_6809() {
    let text = compile_to_text(
        "long a; long b; int main(void) { if (a < b) return (1); return (0); }",
        Target::M6809,
    )
    .unwrap();
    // The high words compare signed, the low words unsigned
    assert!(text.contains("\tcmpy"));
    assert!(text.contains("\tcmpd"));
    assert!(text.contains("\tbhs") || text.contains("\tblo"));
}

#[test]
fn function_frames_balance_the_stack() {
    // Locals, parameters, calls with arguments: the 6809 postamble
    // checks that sp_adjust returns to zero
    let result = compile_to_text(
        "int add(int x, int y) { int z; z = x + y; return (z); }\n\
         int main(void) { return (add(3, add(1, 2))); }",
        Target::M6809,
    );
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn generated_il_for_a_tiny_function() {
    let text = compile_to_text("int main(void) { return(42); }", Target::Qbe).unwrap();
    insta::assert_snapshot!(text, @r###"
    export function w $main() {
    @L2
      %.t1 =w copy 42
      %.ret =w copy %.t1
      jmp @L1
    @L3
    @L1
      ret %.ret
    }
    "###);
}

#[test]
fn generated_asm_for_a_tiny_function() {
    let text = compile_to_text("int main(void) { return(42); }", Target::M6809).unwrap();
    insta::assert_snapshot!(text, @r###"
    ;
    	.code
    ;					line 1
    	.export _main
    _main:
    	ldd #42
    	bra L1
    L1:
    	rts
    ;
    "###);
}

#[test]
fn globals_with_string_initialisers_get_labels() {
    let text = compile_to_text(
        "char *greeting = \"hi\"; int main(void) { return (0); }",
        Target::Qbe,
    )
    .unwrap();
    // The initialiser refers to the string's label
    assert!(text.contains("l $L1,"));
    assert!(text.contains("data $L1 = { b 104, b 105,  b 0 }"));
}

#[test]
fn peephole_simple_rewrite() {
    let rules = "\tldd #0\n=\n\tclra\n\tclrb\n====\n";
    let out = peephole_phase("\tldd #0\n\tstd _x\n", rules).unwrap();
    assert_eq!(out, "\tclra\n\tclrb\n\tstd _x\n");
}

#[test]
fn peephole_wildcards_capture_and_must_agree() {
    let rules = "\tstd %0\n\tldd %0\n=\n\tstd %0\n====\n";
    // Same operand: the load disappears
    let out = peephole_phase("\tstd _x+0\n\tldd _x+0\n", rules).unwrap();
    assert_eq!(out, "\tstd _x+0\n");
    // Different operands: untouched
    let out = peephole_phase("\tstd _x+0\n\tldd _y+0\n", rules).unwrap();
    assert_eq!(out, "\tstd _x+0\n\tldd _y+0\n");
}

#[test]
fn peephole_eval_and_check() {
    let rules = "%check 1 <= %0 <= 64\n%check 1 <= %1 <= 64\n\
                 \tleas %0,s\n\tleas %1,s\n=\n\tleas %eval(%0 %1 +),s\n====\n";
    let out = peephole_phase("\tleas 4,s\n\tleas 6,s\n", rules).unwrap();
    assert_eq!(out, "\tleas 10,s\n");

    // Out of bounds: no fire
    let out = peephole_phase("\tleas 400,s\n\tleas 6,s\n", rules).unwrap();
    assert_eq!(out, "\tleas 400,s\n\tleas 6,s\n");
}

#[test]
fn peephole_fresh_labels() {
    let rules = "\ttstb\n=\n\tbeq L%L\n\tnop\nL%L:\n====\n";
    let out = peephole_phase("\ttstb\n\ttstb\n", rules).unwrap();
    // Each firing mints its own label
    assert_eq!(out, "\tbeq L1\n\tnop\nL1:\n\tbeq L2\n\tnop\nL2:\n");
}

#[test]
fn peephole_once_fires_once() {
    let rules = "\tnop\n=\n%once\n\thcf\n====\n";
    let out = peephole_phase("\tnop\n\tnop\n", rules).unwrap();
    assert_eq!(out, "\thcf\n\tnop\n");
}

#[test]
fn peephole_activation_ships_new_rules() {
    // Seeing a define of %0 activates a rule that rewrites uses of it
    let rules = "DEF %0\n=\n%activate\n\tldd %0\n=\n\tclrd\n====\n";
    let out = peephole_phase("DEF _zero\n\tldd _zero\n\tldd _other\n", rules).unwrap();
    assert!(out.contains("\tclrd\n"));
    assert!(out.contains("\tldd _other\n"));
    // The defining line stays: activation does not rewrite
    assert!(out.contains("DEF _zero\n"));
}

#[test]
fn peephole_rescans_its_own_output() {
    // The first rewrite's output is matched by the second rule
    let rules = "\tnop\n=\n\tbrn\n====\n\tbrn\n=\n\thcf\n====\n";
    let out = peephole_phase("\tnop\n", rules).unwrap();
    assert_eq!(out, "\thcf\n");
}

#[test]
fn ast_dump_names_operations() {
    let src = "int main(void) { return(1 + 2); }";
    let mut tokens = Vec::new();
    scan_phase(src.as_bytes(), &mut tokens).unwrap();

    let serial = std::process::id();
    let ast_path = std::env::temp_dir().join(format!("mcc_dump_ast_{serial}"));
    let idx_path = std::env::temp_dir().join(format!("mcc_dump_idx_{serial}"));

    let mut ast_bytes = Vec::new();
    {
        let mut parser = Parser::new(Cursor::new(tokens), &mut ast_bytes, Target::Qbe).unwrap();
        parser.global_declarations().unwrap();
        parser.ast.finish().unwrap();
    }
    std::fs::write(&ast_path, &ast_bytes).unwrap();

    let mut out = Vec::new();
    let mut loader = AstLoader::open(&ast_path, &idx_path).unwrap();
    crate::ast::dump::dump_functions(&mut loader, false, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();

    assert!(out.contains("FUNCTION"));
    assert!(out.contains("RETURN"));
    // 1 + 2 was folded before serialisation
    assert!(out.contains("INTLIT 3"));

    let _ = std::fs::remove_file(&ast_path);
    let _ = std::fs::remove_file(&idx_path);
}

#[test]
fn string_literals_become_symbols() {
    let parser = parse_source(
        "int puts(char *s); int main(void) { puts(\"hey\"); return(0); }",
        Target::Qbe,
    )
    .unwrap();
    let lit = parser
        .syms
        .globals
        .iter()
        .find(|s| s.kind == SymKind::StrLit)
        .expect("a string literal symbol");
    assert_eq!(lit.name, "hey");
    assert_eq!(lit.class, SymClass::Static);
}

#[test]
fn address_of_marks_the_symbol() {
    let parser = parse_source(
        "int main(void) { int x; int *p; p = &x; return(0); }",
        Target::Qbe,
    )
    .unwrap();
    let main = parser.syms.find_global("main").unwrap();
    let x = main.members.iter().find(|m| m.name == "x").unwrap();
    assert!(x.has_addr);
}
